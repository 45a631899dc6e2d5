use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use llmctl_engine::idempotency::{dispatch_key_seen, register_dispatch_key};

#[test]
fn first_register_wins_and_subsequent_calls_lose() {
    let key = "idempotency-test:first-write-wins";
    assert!(register_dispatch_key(key));
    for _ in 0..5 {
        assert!(!register_dispatch_key(key));
    }
    assert!(dispatch_key_seen(key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_registration_admits_exactly_one_winner() {
    let key = "idempotency-test:concurrent-winner";
    let winners = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..64 {
        let winners = Arc::clone(&winners);
        handles.push(tokio::spawn(async move {
            if register_dispatch_key(key) {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn distinct_keys_do_not_interfere() {
    for index in 0..16 {
        let key = format!("idempotency-test:distinct:{index}");
        assert!(register_dispatch_key(&key));
    }
}
