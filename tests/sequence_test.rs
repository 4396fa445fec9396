//! Integration tests for sequences and sequence groups.

use contbatch::config::GenerationConfig;
use contbatch::core::sequence::{FinishReason, SequenceGroup, SequenceStatus};

fn config() -> GenerationConfig {
    GenerationConfig {
        max_new_tokens: 100,
        ignore_eos: true,
        ..GenerationConfig::greedy()
    }
}

#[test]
fn test_group_lifecycle() {
    let mut group = SequenceGroup::new(7, vec![1, 2, 3, 4, 5], config());

    assert_eq!(group.request_id(), 7);
    assert_eq!(group.prompt_len(), 5);
    assert_eq!(group.context_len(), 5);
    assert!(group.is_waiting());
    assert_eq!(group.sequences()[0].status(), SequenceStatus::Waiting);

    group.set_running();
    group.schedule_tokens(5);
    group.finish_iteration();
    assert!(group.is_running());
    assert!(group.is_prompt_processed());
    assert_eq!(group.num_processed_tokens(), 5);

    let seq_id = group.sequences()[0].seq_id();
    group.sequence_mut(seq_id).unwrap().append_token(42, -0.5);
    assert_eq!(group.context_len(), 6);
    assert_eq!(group.num_tokens_to_process(), 1);
}

#[test]
fn test_token_at_spans_prompt_and_generation() {
    let mut group = SequenceGroup::new(0, vec![10, 20, 30], config());
    let seq_id = group.sequences()[0].seq_id();
    group.set_running();
    group.sequence_mut(seq_id).unwrap().append_token(40, 0.0);
    group.sequence_mut(seq_id).unwrap().append_token(50, 0.0);

    assert_eq!(group.token_at(seq_id, 0).unwrap(), 10);
    assert_eq!(group.token_at(seq_id, 2).unwrap(), 30);
    assert_eq!(group.token_at(seq_id, 3).unwrap(), 40);
    assert_eq!(group.token_at(seq_id, 4).unwrap(), 50);
    assert!(group.token_at(seq_id, 5).is_err());
}

#[test]
fn test_fork_diverges_after_split() {
    let mut group = SequenceGroup::new(0, vec![1, 2], config());
    group.set_running();
    let parent = group.sequences()[0].seq_id();
    group.sequence_mut(parent).unwrap().append_token(3, 0.0);

    let child = group.fork_sequence(parent).unwrap();
    group.sequence_mut(parent).unwrap().append_token(4, 0.0);
    group.sequence_mut(child).unwrap().append_token(5, 0.0);

    assert_eq!(group.sequence(parent).unwrap().generated_ids(), &[3, 4]);
    assert_eq!(group.sequence(child).unwrap().generated_ids(), &[3, 5]);
    // Context length follows the longest live sibling.
    assert_eq!(group.context_len(), 4);
}

#[test]
fn test_finished_sequences_leave_the_running_set() {
    let mut group = SequenceGroup::new(0, vec![1], config());
    group.set_running();
    let parent = group.sequences()[0].seq_id();
    group.sequence_mut(parent).unwrap().append_token(2, 0.0);
    let child = group.fork_sequence(parent).unwrap();

    assert_eq!(group.running_sequences().len(), 2);

    group
        .sequence_mut(child)
        .unwrap()
        .set_finished(FinishReason::StopSequence);
    assert_eq!(group.running_sequences().len(), 1);
    assert_eq!(group.not_finished_sequences().len(), 1);
    assert!(!group.has_finished());

    group
        .sequence_mut(parent)
        .unwrap()
        .set_finished(FinishReason::Length);
    assert!(group.has_finished());
}

#[test]
fn test_finished_sequence_rejects_transitions() {
    let mut group = SequenceGroup::new(0, vec![1], config());
    let seq_id = group.sequences()[0].seq_id();
    group
        .sequence_mut(seq_id)
        .unwrap()
        .set_finished(FinishReason::Dropped);

    assert!(group.sequence_mut(seq_id).unwrap().set_running().is_err());
    assert!(group.sequence_mut(seq_id).unwrap().set_waiting().is_err());
}

#[test]
fn test_drop_marks_every_sequence() {
    let mut group = SequenceGroup::new(0, vec![1, 2], config());
    group.set_running();
    let parent = group.sequences()[0].seq_id();
    group.sequence_mut(parent).unwrap().append_token(9, 0.0);
    group.fork_sequence(parent).unwrap();

    group.finish_all(FinishReason::Dropped);
    assert!(group.has_finished());
    for seq in group.sequences() {
        assert_eq!(seq.finish_reason(), Some(FinishReason::Dropped));
    }
}
