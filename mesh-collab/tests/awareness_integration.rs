//! Integration tests for presence gossip through the wire protocol.
//!
//! Each instance's update events are encoded as awareness messages and
//! delivered to the others, the way a room forwards them.

use std::sync::Arc;
use std::time::Duration;

use mesh_collab::awareness::{Awareness, Origin};
use mesh_collab::codec::Any;
use mesh_collab::protocol::Message;
use parking_lot::Mutex;

type Outbox = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

/// Record every update `awareness` would rebroadcast.
fn capture(awareness: &Arc<Awareness>, outbox: &Outbox) {
    let weak = Arc::downgrade(awareness);
    let outbox = outbox.clone();
    awareness.on_update(move |changes, origin| {
        let Some(awareness) = weak.upgrade() else { return };
        // remote updates are only re-sent when they concern us
        let own = changes.all().contains(&awareness.client_id());
        if !matches!(origin, Origin::Remote(_)) || own {
            let msg = Message::awareness(awareness.encode_update(&changes.all()));
            outbox.lock().push((awareness.client_id(), msg.encode()));
        }
    });
}

/// Deliver everything queued so far to every instance but the sender.
fn flush(outbox: &Outbox, peers: &[Arc<Awareness>]) {
    let pending: Vec<_> = std::mem::take(&mut *outbox.lock());
    for (sender, bytes) in pending {
        let Message::Awareness(update) = Message::decode(&bytes).unwrap() else {
            panic!("expected awareness message");
        };
        for peer in peers.iter().filter(|p| p.client_id() != sender) {
            peer.apply_update(&update, Origin::Remote(sender.to_string())).unwrap();
        }
    }
}

fn mesh(ids: &[u32]) -> (Vec<Arc<Awareness>>, Outbox) {
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    let peers: Vec<_> = ids.iter().map(|id| Arc::new(Awareness::new(*id))).collect();
    for peer in &peers {
        capture(peer, &outbox);
        // announce the initial state
        let msg = Message::awareness(peer.encode_full_update());
        outbox.lock().push((peer.client_id(), msg.encode()));
    }
    (peers, outbox)
}

#[test]
fn test_three_clients_converge() {
    let (peers, outbox) = mesh(&[1, 2, 3]);
    flush(&outbox, &peers);

    peers[0].set_local_state_field("name", "alice");
    peers[1].set_local_state_field("name", "bob");
    peers[2].set_local_state(None);
    flush(&outbox, &peers);

    for peer in &peers {
        let states = peer.states();
        assert_eq!(states.len(), 2, "client {} sees {states:?}", peer.client_id());
        assert_eq!(states[&1].get("name"), Some(&Any::from("alice")));
        assert_eq!(states[&2].get("name"), Some(&Any::from("bob")));
        assert_eq!(peer.meta(3).unwrap().clock, 1);
    }
}

#[test]
fn test_late_joiner_catches_up_from_snapshot() {
    let (peers, outbox) = mesh(&[1, 2]);
    flush(&outbox, &peers);
    peers[0].set_local_state_field("cursor", 42.0);
    flush(&outbox, &peers);

    let late = Arc::new(Awareness::new(9));
    let snapshot = Message::awareness(peers[0].encode_full_update()).encode();
    let Message::Awareness(update) = Message::decode(&snapshot).unwrap() else {
        panic!("expected awareness message");
    };
    late.apply_update(&update, Origin::Remote("1".into())).unwrap();

    let mut ids = late.client_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 9]);
    assert_eq!(late.state(1).unwrap().get("cursor"), Some(&Any::from(42.0)));
}

#[test]
fn test_remote_removal_is_overridden_by_owner() {
    let (peers, outbox) = mesh(&[1, 2]);
    flush(&outbox, &peers);

    // client 2 tries to take client 1 offline
    let forged = {
        let mut encoder = mesh_collab::codec::Encoder::new();
        encoder.write_var_uint(1);
        encoder.write_var_uint(1);
        encoder.write_var_uint(u64::from(peers[0].meta(1).unwrap().clock));
        encoder.write_var_string("null");
        encoder.into_bytes()
    };
    let before = peers[0].meta(1).unwrap().clock;
    peers[0].apply_update(&forged, Origin::Remote("2".into())).unwrap();
    assert!(peers[0].local_state().is_some());
    assert_eq!(peers[0].meta(1).unwrap().clock, before + 1);

    // the owner's refresh wins everywhere
    flush(&outbox, &peers);
    assert!(peers[1].state(1).is_some());
    assert_eq!(peers[1].meta(1).unwrap().clock, before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_times_out_everywhere() {
    let (peers, outbox) = mesh(&[1, 2, 3]);
    flush(&outbox, &peers);
    let sweepers: Vec<_> = peers.iter().map(|p| p.spawn_sweeper()).collect();

    // 1 and 2 keep gossiping their renewals; 3 goes silent
    let silent = peers[2].clone();
    let live = vec![peers[0].clone(), peers[1].clone()];
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        outbox.lock().retain(|(sender, _)| *sender != silent.client_id());
        flush(&outbox, &live);
    }

    for peer in &live {
        assert!(peer.state(3).is_none(), "client {} still sees 3", peer.client_id());
        assert!(peer.state(1).is_some() && peer.state(2).is_some());
    }
    for sweeper in sweepers {
        sweeper.abort();
    }
}
