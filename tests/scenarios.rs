//! Cross-module scenarios exercised against the public crate surface: a full
//! engine open/close/reopen cycle, snapshot isolation across transactions,
//! and a case-insensitive prefix scan built from the generic `Direction` +
//! `KeyFilter` traversal primitives.

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use heartwood::btree::{Key, Segment};
use heartwood::config::EngineConfig;
use heartwood::db::Engine;
use heartwood::tree::Direction;

fn open_engine(dir: &Path, volume_name: &str) -> Arc<Engine> {
    let volume_path = dir.join(format!("{volume_name}.v01"));
    let mut config = EngineConfig::durable();
    config.data_path = dir.to_path_buf();
    config.journal_path = dir.join("journal");
    config.volume_specs = vec![format!("{},create,pageSize:4096,name:{volume_name}", volume_path.display())];
    Engine::open(config).expect("engine open")
}

/// Scenario: begin a transaction, store ten keys, roll back, checkpoint, then
/// close and reopen the engine against the same data/journal directories.
/// The rolled-back transaction's writes must not resurface after recovery —
/// a crash recovered by journal replay never honors a transaction that
/// aborted before it, regardless of whether its page images made it to disk.
#[test]
fn aborted_transaction_is_not_recovered_after_restart() {
    let dir = tempdir().unwrap();
    let volume_name = "vtest";

    {
        let engine = open_engine(dir.path(), volume_name);
        let volume = engine.volume_ids()[0];

        let txn = engine.begin(volume).unwrap();
        let ex = txn.exchange("widgets", true).unwrap();
        for i in 0..10u64 {
            ex.store(Key::encode(&[Segment::U64(i)]), i.to_be_bytes().to_vec()).unwrap();
        }
        txn.rollback().unwrap();

        engine.checkpoint().unwrap();
        engine.shutdown();
    }

    let restarted = open_engine(dir.path(), volume_name);
    let volume = restarted.volume_ids()[0];
    let txn = restarted.begin(volume).unwrap();
    let ex = txn.exchange("widgets", false).unwrap();

    for i in 0..10u64 {
        assert_eq!(ex.fetch(&Key::encode(&[Segment::U64(i)])).unwrap(), None, "key {i} should not have recovered");
    }

    let mut cursor = ex.traverse(&Key::before_all(), Direction::Gt, None, 100).unwrap();
    assert!(cursor.next().unwrap().is_none(), "forward traversal should find no keys");
    txn.commit().unwrap();
}

/// Scenario: a writer's uncommitted store is invisible to a concurrently
/// active reader's snapshot; once the writer commits, a *new* transaction
/// (not the already-snapshotted reader) sees it.
#[test]
fn snapshot_isolation_hides_uncommitted_writes() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), "vtest");
    let volume = engine.volume_ids()[0];

    let reader = engine.begin(volume).unwrap();
    let reader_ex = reader.exchange("accounts", true).unwrap();

    let writer = engine.begin(volume).unwrap();
    let writer_ex = writer.exchange("accounts", false).unwrap();
    writer_ex.store(Key::encode(&[Segment::Str("alice".into())]), b"100".to_vec()).unwrap();

    assert_eq!(reader_ex.fetch(&Key::encode(&[Segment::Str("alice".into())])).unwrap(), None);

    writer.commit().unwrap();
    assert_eq!(reader_ex.fetch(&Key::encode(&[Segment::Str("alice".into())])).unwrap(), None);
    reader.commit().unwrap();

    let later = engine.begin(volume).unwrap();
    let later_ex = later.exchange("accounts", false).unwrap();
    assert_eq!(later_ex.fetch(&Key::encode(&[Segment::Str("alice".into())])).unwrap(), Some(b"100".to_vec()));
    later.commit().unwrap();
}

/// Scenario: case-insensitive prefix counting built from the generic
/// traversal primitives (`Direction::GtEq`/`Gt` plus a `KeyFilter` closure),
/// not a bespoke engine feature. Positions the scan at the upper-cased
/// prefix and walks forward past the lower-cased prefix's upper bound,
/// folding case on each candidate before counting it.
#[test]
fn case_insensitive_prefix_count_via_traversal_primitives() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path(), "vtest");
    let volume = engine.volume_ids()[0];

    let txn = engine.begin(volume).unwrap();
    let ex = txn.exchange("words", true).unwrap();
    for word in ["Alpha", "Beta", "beta", "atomic", "Chutney", "ChuKoo", "CHUKOO", "cHuKoO", "chuckie"] {
        ex.store(Key::encode(&[Segment::Str(word.into())]), word.as_bytes().to_vec()).unwrap();
    }
    txn.commit().unwrap();

    let txn = engine.begin(volume).unwrap();
    let ex = txn.exchange("words", false).unwrap();

    let cases = [("ALPHA", 1usize), ("A", 2), ("B", 2), ("BZ", 0), ("CHUT", 1), ("CHU", 5)];
    for (prefix, expected) in cases {
        let count = case_insensitive_prefix_count(&ex, prefix);
        assert_eq!(count, expected, "prefix {prefix:?}");
    }
    txn.commit().unwrap();
}

fn case_insensitive_prefix_count(ex: &heartwood::db::TxExchange<'_>, prefix: &str) -> usize {
    let upper = prefix.to_uppercase();
    let lower = prefix.to_lowercase();
    // Raw (unterminated) prefix bytes, not `Key::encode`'s segment form: we
    // want a bound on the *string's* byte prefix, not on one complete
    // single-segment key, so nudging must append 0xFF right after the
    // prefix bytes themselves rather than after a trailing segment
    // terminator.
    let start = Key::from_raw(upper.into_bytes());
    let end = Key::from_raw(lower.clone().into_bytes()).nudge_right();

    let mut cursor = ex.traverse(&start, Direction::GtEq, None, 10_000).unwrap();
    let mut count = 0;
    while let Some((key, _value)) = cursor.next().unwrap() {
        if key.compare(&end) == std::cmp::Ordering::Greater {
            break;
        }
        if key_starts_with_fold(&key, &lower) {
            count += 1;
        }
    }
    count
}

/// Strips the single trailing segment terminator byte a one-`Segment::Str`
/// key encodes to and compares the rest, ASCII-folded, against `lower`.
fn key_starts_with_fold(key: &Key, lower: &str) -> bool {
    let bytes = key.as_bytes();
    let body = &bytes[..bytes.len().saturating_sub(1)];
    let Ok(text) = std::str::from_utf8(body) else { return false };
    text.len() >= lower.len() && text[..lower.len()].eq_ignore_ascii_case(lower)
}
