//! Property tests for task state transitions.

use super::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Claim,
    Complete,
    Cancel,
    Fail,
    Retry,
    Requeue,
    DeadLetter,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Claim),
        Just(Op::Complete),
        Just(Op::Cancel),
        Just(Op::Fail),
        Just(Op::Retry),
        Just(Op::Requeue),
        Just(Op::DeadLetter),
    ]
}

fn fresh_store() -> Store {
    let store = Store::open_in_memory().unwrap();
    store
        .insert_agent(&AgentRecord {
            agent_id: "a".to_string(),
            display_name: "a".to_string(),
            provider: "echo".to_string(),
            model: "goclaw-v1".to_string(),
            soul: String::new(),
            worker_count: 1,
            task_timeout_seconds: 600,
            max_queue_depth: 0,
            api_key_env: None,
            agent_emoji: None,
            preferred_search: None,
            status: AgentStatus::Active,
        })
        .unwrap();
    store.ensure_session("s").unwrap();
    store
        .create_task(
            "t",
            "s",
            "a",
            &serde_json::json!({ "type": "chat", "content": "x" }),
            None,
        )
        .unwrap();
    store
}

proptest! {
    /// Whatever sequence of transitions is attempted, a terminal status is
    /// never overwritten, and per-session event ids stay strictly
    /// increasing.
    #[test]
    fn terminal_stickiness_and_event_monotonicity(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let store = fresh_store();
        let mut first_terminal: Option<TaskStatus> = None;

        for op in ops {
            match op {
                Op::Claim => { let _ = store.claim_task("a", "w"); }
                Op::Complete => { let _ = store.complete_task("t", "ok"); }
                Op::Cancel => { let _ = store.cancel_task("t", "stop"); }
                Op::Fail => { let _ = store.fail_task("t", "err"); }
                Op::Retry => { let _ = store.schedule_retry("t"); }
                Op::Requeue => { let _ = store.requeue_task("t"); }
                Op::DeadLetter => { let _ = store.dead_letter_task("t", "dead"); }
            }
            let status = store.get_task("t").unwrap().unwrap().status;
            match first_terminal {
                Some(terminal) => prop_assert_eq!(status, terminal),
                None if status.is_terminal() => first_terminal = Some(status),
                None => {}
            }
        }

        let events = store.events_after("s", 0, 1000).unwrap();
        prop_assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));
    }
}
