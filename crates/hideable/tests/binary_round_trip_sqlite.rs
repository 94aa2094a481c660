use hideable::prelude::*;
use proptest::prelude::*;

fn store(db: &Database, name: &str, data: &[u8]) {
    let mut sql = b"INSERT INTO attachment (name, data) VALUES ('".to_vec();
    sql.extend(db.escape(name).as_bytes());
    sql.extend(b"', ");
    sql.extend(quote_literal(data));
    sql.push(b')');
    db.exec(&sql).unwrap();
}

fn stored_bytes(db: &Database, name: &str) -> Vec<u8> {
    let sql = format!(
        "SELECT data FROM attachment WHERE name = '{}'",
        db.escape(name)
    );
    let row = db.query_row(sql).unwrap().expect("row stored");
    row.get_bytes("data").unwrap().to_vec()
}

fn load(db: &Database, name: &str) -> Vec<u8> {
    let raw = stored_bytes(db, name);
    db.unescape_binary(&raw).unwrap().into_owned()
}

fn attachment_db() -> Database {
    let db = Database::open_memory().unwrap();
    db.exec("CREATE TABLE attachment (name TEXT PRIMARY KEY, data TEXT)")
        .unwrap();
    db
}

#[test]
fn nul_quote_and_sentinel_survive_sql_text() {
    let db = attachment_db();
    let data = [0x00, 0x27, 0x01];
    store(&db, "tricky.bin", &data);

    let stored = stored_bytes(&db, "tricky.bin");
    assert_eq!(stored[0], 0x01);
    assert!(!stored[2..].contains(&0x00));
    assert!(!stored[2..].contains(&0x27));
    assert_eq!(load(&db, "tricky.bin"), data);
}

#[test]
fn every_byte_value_survives() {
    let db = attachment_db();
    let data: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
    store(&db, "all.bin", &data);
    assert_eq!(load(&db, "all.bin"), data);
}

#[test]
fn plain_text_is_stored_readable() {
    let db = attachment_db();
    store(&db, "page", b"it's a wiki");
    assert_eq!(stored_bytes(&db, "page"), b"it's a wiki");
    assert_eq!(load(&db, "page"), b"it's a wiki");

    store(&db, "empty", b"");
    assert_eq!(load(&db, "empty"), b"");
}

#[test]
fn sql_decode_binary_reads_stored_values() {
    let db = attachment_db();
    let data = b"\x01leading sentinel\x00and nul".to_vec();
    store(&db, "blob", &data);

    let decoded = db
        .query_column("SELECT decode_binary(data) FROM attachment WHERE name = 'blob'")
        .unwrap();
    assert_eq!(decoded, vec![Value::Blob(data)]);
}

#[test]
fn corrupted_value_is_reported_not_substituted() {
    let db = attachment_db();
    db.exec(b"INSERT INTO attachment VALUES ('bad', '\x01\x05\x01')".as_slice())
        .unwrap();
    let raw = stored_bytes(&db, "bad");
    match db.unescape_binary(&raw) {
        Err(Error::Codec(CodecError::MalformedEncoding { offset, .. })) => assert_eq!(offset, 2),
        other => panic!("expected codec error, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arbitrary_bytes_round_trip_through_sqlite(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let db = attachment_db();
        store(&db, "any", &data);
        prop_assert_eq!(load(&db, "any"), data);
    }
}
