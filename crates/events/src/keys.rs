//! Deterministic idempotency keys.
//!
//! Producing twice with the same key must not create a second logical record;
//! the broker suppresses the duplicate. Keys only depend on the logical
//! identity of the record (run, generation, attempt), never on time.

use runrelay_core::RunId;

/// Key of the command that executes generation `replay_seq` of a run.
pub fn command(run_id: &RunId, replay_seq: u64) -> String {
    format!("cmd:{run_id}:{replay_seq}")
}

/// Key of the `run.created` event.
pub fn created(run_id: &RunId) -> String {
    format!("evt:{run_id}:created")
}

/// Key of the `run.replay_requested` event for a generation.
pub fn replay_requested(run_id: &RunId, replay_seq: u64) -> String {
    format!("evt:{run_id}:replay:{replay_seq}")
}

/// Key of the dead-letter record of a generation.
pub fn dead_letter(run_id: &RunId, replay_seq: u64, final_attempt: u32) -> String {
    format!("dlq:{run_id}:{replay_seq}:{final_attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        let run_id: RunId = "r1".parse().unwrap();
        assert_eq!(command(&run_id, 0), "cmd:r1:0");
        assert_eq!(created(&run_id), "evt:r1:created");
        assert_eq!(replay_requested(&run_id, 2), "evt:r1:replay:2");
        assert_eq!(dead_letter(&run_id, 1, 3), "dlq:r1:1:3");
    }

    #[test]
    fn generations_never_share_a_command_key() {
        let run_id: RunId = "r1".parse().unwrap();
        assert_ne!(command(&run_id, 0), command(&run_id, 1));
    }
}
