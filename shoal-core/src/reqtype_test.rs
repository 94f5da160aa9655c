use crate::reqtype::{WriteReqType, ALL_WRITE_REQ_TYPES};

#[test]
fn codes_and_names_round_trip() {
    for reqtype in ALL_WRITE_REQ_TYPES.iter().copied() {
        assert_eq!(WriteReqType::from_code(reqtype.code()), Some(reqtype), "code round-trip failed for {}", reqtype);
        assert_eq!(WriteReqType::parse(reqtype.as_str()), Some(reqtype), "name round-trip failed for {}", reqtype);
    }
    assert_eq!(WriteReqType::from_code(0), None);
    assert_eq!(WriteReqType::from_code(999), None);
}

#[test]
fn non_write_actions_are_rejected() {
    assert_eq!(WriteReqType::parse("documents_search"), None);
    assert_eq!(WriteReqType::parse(""), None);
}

#[test]
fn replay_set_membership() {
    let replayable: Vec<_> = ALL_WRITE_REQ_TYPES.iter().filter(|t| t.is_replay_safe()).collect();
    assert_eq!(replayable.len(), 14, "unexpected replay set size");
    assert!(WriteReqType::DocumentsVisit.is_replay_safe());
    assert!(WriteReqType::RecommendTrackEvent.is_replay_safe());
    // Forward-only types must never be replayed from the log.
    assert!(!WriteReqType::DocumentsCreate.is_replay_safe());
    assert!(!WriteReqType::CollectionRebuildFromScd.is_replay_safe());
    assert!(!WriteReqType::CommandsIndex.is_replay_safe());
}

#[test]
fn auto_shard_set_membership() {
    let auto: Vec<_> = ALL_WRITE_REQ_TYPES.iter().filter(|t| t.is_auto_shard()).collect();
    assert_eq!(auto.len(), 18, "unexpected auto-shard set size");
    assert!(WriteReqType::CommandsMining.is_auto_shard());
    assert!(WriteReqType::KeywordsInjectQueryCorrection.is_auto_shard());
    // Key-targeted types route only to the shard derived from the request.
    assert!(!WriteReqType::DocumentsCreate.is_auto_shard());
    assert!(!WriteReqType::DocumentsVisit.is_auto_shard());
}
