use run_forwarder::domain::{HistoryRecord, OutputRecord, Record, RecordPayload};
use run_forwarder::store::{OpenMode, Store, StoreError, codec::BLOCK_SIZE};
use tempfile::TempDir;

fn numbered(num: i64) -> Record {
    let mut record = Record::new(RecordPayload::History(HistoryRecord {
        step: num,
        items: Vec::new(),
    }));
    record.num = num;
    record
}

fn output(line: String) -> Record {
    Record::new(RecordPayload::Output(OutputRecord {
        line,
        ..OutputRecord::default()
    }))
}

#[test]
fn five_records_round_trip_then_eof() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");

    let written: Vec<Record> = (1..=5).map(numbered).collect();
    let mut store = Store::open(&path, OpenMode::Write).unwrap();
    for record in &written {
        store.write(record).unwrap();
    }
    store.close().unwrap();

    let mut store = Store::open(&path, OpenMode::Read).unwrap();
    for expected in &written {
        let record = store.read().unwrap().expect("record before eof");
        assert_eq!(&record, expected);
    }
    assert!(store.read().unwrap().is_none());
    assert!(store.read().unwrap().is_none());
}

#[test]
fn corrupt_chunk_is_reported_and_reading_resumes_after_the_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");

    let a = output("a".to_string());
    let spanning = output("x".repeat(40_000));
    let b = output("b".to_string());
    let mut store = Store::open(&path, OpenMode::Write).unwrap();
    store.write(&a).unwrap();
    store.write(&spanning).unwrap();
    store.write(&b).unwrap();
    store.close().unwrap();

    // Damage the first chunk of the record spanning into the second block.
    let mut bytes = std::fs::read(&path).unwrap();
    assert!(bytes.len() > BLOCK_SIZE);
    bytes[20_000] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let mut store = Store::open(&path, OpenMode::Read).unwrap();
    assert_eq!(store.read().unwrap().unwrap(), a);
    let err = store.read().unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)), "{err}");
    assert!(err.is_recoverable());
    assert_eq!(store.read().unwrap().unwrap(), b);
    assert!(store.read().unwrap().is_none());
}

#[test]
fn foreign_headers_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cases: [(&str, &[u8]); 4] = [
        ("ident", b"XW&B\xe1\xbe\x00"),
        ("magic", b":W&B\xe2\xbe\x00"),
        ("version", b":W&B\xe1\xbe\x01"),
        ("short", b":W&"),
    ];
    for (name, header) in cases {
        let path = dir.path().join(name);
        std::fs::write(&path, header).unwrap();
        let result = Store::open(&path, OpenMode::Read);
        assert!(
            matches!(result, Err(StoreError::InvalidHeader(_))),
            "{name} header was accepted"
        );
    }
}

#[test]
fn matching_header_with_no_records_reads_eof() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.log");
    std::fs::write(&path, b":W&B\xe1\xbe\x00").unwrap();
    let mut store = Store::open(&path, OpenMode::Read).unwrap();
    assert!(store.read().unwrap().is_none());
}

#[test]
fn write_after_close_fails_with_closed() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::open(dir.path().join("run.log"), OpenMode::Write).unwrap();
    store.write(&numbered(1)).unwrap();
    store.close().unwrap();
    store.close().unwrap();

    assert!(matches!(store.write(&numbered(2)), Err(StoreError::Closed)));
    assert!(store.is_closed());
}

#[test]
fn write_mode_never_overwrites_an_existing_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");
    let mut store = Store::open(&path, OpenMode::Write).unwrap();
    store.write(&numbered(1)).unwrap();
    store.close().unwrap();

    assert!(matches!(
        Store::open(&path, OpenMode::Write),
        Err(StoreError::Open { .. })
    ));
    let mut reader = Store::open(&path, OpenMode::Read).unwrap();
    assert_eq!(reader.read().unwrap().unwrap().num, 1);
}
