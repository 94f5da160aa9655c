use anyhow::{Context, Result};
use rand::prelude::*;

use super::{CommonReqData, RequestLog, RequestLogMgr, HEAD_SIZE};
use shoal_core::reqtype::WriteReqType;
use shoal_core::LogError;

fn tmpdir() -> Result<tempfile::TempDir> {
    tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")
}

fn prepare_and_append(log: &mut RequestLog, reqtype: WriteReqType, payload: &[u8]) -> Result<u32> {
    let req = CommonReqData::new(reqtype.code(), payload.to_vec());
    let stamped = log.prepare(req, true)?;
    log.append(payload)?;
    log.discard_prepared();
    Ok(stamped.inc_id)
}

#[test]
fn single_entry_lifecycle() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;

    let req = CommonReqData::new(WriteReqType::DocumentsCreate.code(), b"A".to_vec());
    let stamped = log.prepare(req, true)?;
    assert_eq!(stamped.inc_id, 1, "first primary write must be stamped with id 1");
    log.append(b"A")?;
    log.discard_prepared();

    let entry = log.get_by_id(1)?;
    assert_eq!(entry.head.inc_id, 1);
    assert_eq!(entry.head.reqtype, WriteReqType::DocumentsCreate.code() as u32);
    assert_eq!(entry.payload, b"A".to_vec());
    assert_eq!(log.next_inc_id(), 2);
    Ok(())
}

#[test]
fn primary_ids_are_strictly_monotonic_without_gaps() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;
    let mut rng = rand::thread_rng();

    for expected in 1..=100u32 {
        let payload: Vec<u8> = (0..rng.gen_range(1..64)).map(|_| rng.gen()).collect();
        let id = prepare_and_append(&mut log, WriteReqType::DocumentsUpdate, &payload)?;
        assert_eq!(id, expected, "primary ids must start at 1 and have no gaps");
    }
    let (ids, _) = log.list_ids(1, 1000, false)?;
    assert_eq!(ids, (1..=100).collect::<Vec<u32>>());
    Ok(())
}

#[test]
fn only_one_prepared_write_per_node() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;

    log.prepare(CommonReqData::new(1, b"x".to_vec()), true)?;
    let res = log.prepare(CommonReqData::new(1, b"y".to_vec()), true);
    assert!(matches!(res, Err(LogError::AlreadyPrepared)), "expected AlreadyPrepared, got {:?}", res);

    log.discard_prepared();
    log.prepare(CommonReqData::new(1, b"y".to_vec()), true)?;
    Ok(())
}

#[test]
fn append_requires_prepared_slot() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;
    let res = log.append(b"payload");
    assert!(matches!(res, Err(LogError::NotPrepared)), "expected NotPrepared, got {:?}", res);
    Ok(())
}

#[test]
fn replica_adopts_primary_id_and_rejects_stale() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;

    // Advance the local log to inc_id_next == 3.
    prepare_and_append(&mut log, WriteReqType::DocumentsVisit, b"one")?;
    prepare_and_append(&mut log, WriteReqType::DocumentsVisit, b"two")?;
    assert_eq!(log.next_inc_id(), 3);

    // A primary handing down id 5 is adopted and advances the local clock.
    let mut req = CommonReqData::new(WriteReqType::DocumentsVisit.code(), b"five".to_vec());
    req.inc_id = 5;
    log.prepare(req, false)?;
    log.append(b"five")?;
    log.discard_prepared();
    assert_eq!(log.next_inc_id(), 6);

    // A primary replaying id 4 is stale.
    let mut stale = CommonReqData::new(WriteReqType::DocumentsVisit.code(), b"four".to_vec());
    stale.inc_id = 4;
    let res = log.prepare(stale, false);
    assert!(matches!(res, Err(LogError::Stale { given: 4, expected: 6 })), "expected Stale, got {:?}", res);
    Ok(())
}

#[test]
fn get_by_id_lower_bound_agrees_with_linear_scan() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;

    // Replica-stamped ids with gaps exercise the lower-bound path.
    for id in [1u32, 2, 5, 9, 10, 17] {
        let mut req = CommonReqData::new(WriteReqType::RecommendVisitItem.code(), id.to_string().into_bytes());
        req.inc_id = id;
        log.prepare(req, false)?;
        log.append(id.to_string().as_bytes())?;
        log.discard_prepared();
    }

    // Linear scan as the oracle.
    let mut scan = Vec::new();
    let mut offset = 0;
    while let Some((entry, next)) = log.get_by_head_offset(offset)? {
        scan.push(entry.head.inc_id);
        offset = next;
    }
    assert_eq!(scan, vec![1, 2, 5, 9, 10, 17]);

    for wanted in 1..=log.last_written_id() + 1 {
        let oracle = scan.iter().copied().find(|id| *id >= wanted);
        match (log.get_by_id(wanted), oracle) {
            (Ok(entry), Some(expected)) => {
                assert_eq!(entry.head.inc_id, expected, "lower bound disagreed with linear scan for {}", wanted);
                assert_eq!(entry.payload, expected.to_string().into_bytes());
            }
            (Err(LogError::NotFound), None) => (),
            (res, oracle) => panic!("unexpected outcome for id {}: {:?} vs oracle {:?}", wanted, res.map(|e| e.head.inc_id), oracle),
        }
    }
    Ok(())
}

#[test]
fn payload_round_trip_with_matching_crc() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;
    let mut rng = rand::thread_rng();

    let mut payloads = Vec::new();
    for _ in 0..20 {
        let payload: Vec<u8> = (0..rng.gen_range(0..512)).map(|_| rng.gen()).collect();
        let id = prepare_and_append(&mut log, WriteReqType::CollectionSetKv, &payload)?;
        payloads.push((id, payload));
    }
    for (id, payload) in payloads {
        let entry = log.get_by_id(id)?;
        assert_eq!(entry.payload, payload, "payload for entry {} failed to round-trip", id);
        assert_eq!(entry.head.req_data_crc, crc32fast::hash(&payload));
    }
    Ok(())
}

#[test]
fn restart_recovers_next_id_and_clears_prepared() -> Result<()> {
    let dir = tmpdir()?;
    {
        let mut log = RequestLog::open(dir.path())?;
        prepare_and_append(&mut log, WriteReqType::DocumentsCreate, b"A")?;
        // Crash between append and discard: leave the slot occupied.
        let req = CommonReqData::new(WriteReqType::DocumentsCreate.code(), b"B".to_vec());
        log.prepare(req, true)?;
        log.append(b"B")?;
    }

    let log = RequestLog::open(dir.path())?;
    assert_eq!(log.next_inc_id(), 3, "restart must resume from last head + 1");
    assert_eq!(log.last_written_id(), 2);
    assert!(log.prepared().is_none(), "prepared slot must be empty after restart");
    let entry = log.get_by_id(2)?;
    assert_eq!(entry.payload, b"B".to_vec(), "appended entry must survive the crash intact");
    Ok(())
}

#[test]
fn restart_after_aligned_truncation() -> Result<()> {
    let dir = tmpdir()?;
    {
        let mut log = RequestLog::open(dir.path())?;
        for _ in 0..5 {
            prepare_and_append(&mut log, WriteReqType::DocumentsUpdate, b"payload")?;
        }
    }

    // Truncate the head file to every aligned prefix and verify recovery.
    for keep in (1..=4u64).rev() {
        let head_path = dir.path().join("head.req.log");
        let file = std::fs::OpenOptions::new().write(true).open(&head_path)?;
        file.set_len(keep * HEAD_SIZE)?;
        drop(file);

        let log = RequestLog::open(dir.path())?;
        assert_eq!(log.next_inc_id() as u64, keep + 1, "next id must track the truncated head file");
    }
    Ok(())
}

#[test]
fn unaligned_head_file_fails_open() -> Result<()> {
    let dir = tmpdir()?;
    {
        let mut log = RequestLog::open(dir.path())?;
        for _ in 0..3 {
            prepare_and_append(&mut log, WriteReqType::DocumentsUpdate, b"payload")?;
        }
    }

    // 2.5 headers worth of bytes is corruption.
    let head_path = dir.path().join("head.req.log");
    let file = std::fs::OpenOptions::new().write(true).open(&head_path)?;
    file.set_len(HEAD_SIZE * 5 / 2)?;
    drop(file);

    let res = RequestLog::open(dir.path());
    assert!(matches!(res, Err(LogError::Corrupt(_))), "expected corrupt head file to fail open");
    Ok(())
}

#[test]
fn flipped_payload_byte_is_fatal() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;
    prepare_and_append(&mut log, WriteReqType::DocumentsCreate, b"payload-under-test")?;

    // Flip one payload byte on disk.
    let bucket_path = dir.path().join("0.req.log");
    let mut raw = std::fs::read(&bucket_path)?;
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    std::fs::write(&bucket_path, raw)?;

    let res = log.get_by_id(1);
    assert!(matches!(res, Err(LogError::Corrupt(_))), "expected crc mismatch to be fatal, got {:?}", res.map(|e| e.head.inc_id));
    Ok(())
}

#[test]
fn appends_must_not_regress_behind_the_log() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;
    // Advance the log to id 7 via a replica-stamped entry.
    let mut req = CommonReqData::new(WriteReqType::DocumentsVisit.code(), b"seven".to_vec());
    req.inc_id = 7;
    log.prepare(req, false)?;
    log.append(b"seven")?;
    log.discard_prepared();

    // A prepared entry below the last written id must not append.
    let mut regressed = CommonReqData::new(WriteReqType::DocumentsVisit.code(), b"three".to_vec());
    regressed.inc_id = 3;
    log.prepared = Some(regressed);
    let res = log.append(b"three");
    assert!(matches!(res, Err(LogError::Stale { .. })), "expected out-of-order append to fail, got {:?}", res);
    Ok(())
}

#[test]
fn bucket_files_roll_over_every_span() -> Result<()> {
    let dir = tmpdir()?;
    let mut log = RequestLog::open(dir.path())?;

    let mut req = CommonReqData::new(WriteReqType::DocumentsVisit.code(), b"far".to_vec());
    req.inc_id = 250_000;
    log.prepare(req, false)?;
    log.append(b"far")?;
    log.discard_prepared();

    assert!(dir.path().join("2.req.log").exists(), "expected id 250000 to land in bucket 2");
    let entry = log.get_by_id(250_000)?;
    assert_eq!(entry.payload, b"far".to_vec());
    Ok(())
}

#[tokio::test]
async fn manager_serializes_and_round_trips() -> Result<()> {
    let dir = tmpdir()?;
    let mgr = RequestLogMgr::open(dir.path().to_path_buf()).await?;

    let req = CommonReqData::new(WriteReqType::DocumentsCreate.code(), b"async".to_vec());
    let stamped = mgr.prepare(req, true).await?;
    assert_eq!(stamped.inc_id, 1);
    assert_eq!(mgr.get_prepared().await?.map(|req| req.inc_id), Some(1));

    mgr.append(b"async".to_vec()).await?;
    mgr.discard_prepared().await?;
    assert_eq!(mgr.get_prepared().await?, None);

    let entry = mgr.get_by_id(1).await?;
    assert_eq!(entry.payload, b"async".to_vec());
    assert_eq!(mgr.next_inc_id().await?, 2);
    assert_eq!(mgr.last_written_id().await?, 1);
    Ok(())
}
