use pg_autojoin::wire::{
    self, Frame, StartupMessage, MSG_PARSE, MSG_QUERY, MSG_ROW_DESCRIPTION, VERSION_SSL,
    VERSION_V3,
};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn frame_roundtrip() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let frame = Frame::new(b'C', b"SELECT 1\0".to_vec());
    frame.write(&mut a).await.unwrap();
    let read = Frame::read(&mut b).await.unwrap().unwrap();
    assert_eq!(read, frame);
}

#[tokio::test]
async fn clean_eof_reads_as_none() {
    let (a, mut b) = tokio::io::duplex(1024);
    drop(a);
    assert_eq!(Frame::read(&mut b).await.unwrap(), None);
}

#[tokio::test]
async fn startup_request_decodes_params() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let raw = b"user\0tester\0database\0testdb\0\0";
    a.write_all(&wire::encode_startup(VERSION_V3, raw))
        .await
        .unwrap();
    match wire::read_startup(&mut b).await.unwrap() {
        StartupMessage::Startup { params, raw: got } => {
            assert_eq!(params.get("user").map(String::as_str), Some("tester"));
            assert_eq!(params.get("database").map(String::as_str), Some("testdb"));
            assert_eq!(got, raw.to_vec());
        }
        other => panic!("unexpected startup message: {other:?}"),
    }
}

#[tokio::test]
async fn ssl_request_decodes() {
    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&wire::encode_startup(VERSION_SSL, &[]))
        .await
        .unwrap();
    assert!(matches!(
        wire::read_startup(&mut b).await.unwrap(),
        StartupMessage::SslRequest
    ));
}

#[test]
fn query_frame_roundtrip() {
    let frame = wire::query_frame("SELECT email FROM users");
    assert_eq!(frame.msg_type, MSG_QUERY);
    assert_eq!(wire::query_text(&frame).unwrap(), "SELECT email FROM users");
}

#[test]
fn parse_message_rewrite_keeps_the_tail() {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"stmt\0");
    payload.extend_from_slice(b"SELECT 1\0");
    // One parameter with type oid 23.
    payload.extend_from_slice(&1i16.to_be_bytes());
    payload.extend_from_slice(&23i32.to_be_bytes());
    let frame = Frame::new(MSG_PARSE, payload);

    let parsed = wire::decode_parse(&frame).unwrap();
    assert_eq!(parsed.name, "stmt");
    assert_eq!(parsed.sql, "SELECT 1");

    let rewritten = parsed.with_sql("SELECT 2");
    let reparsed = wire::decode_parse(&rewritten).unwrap();
    assert_eq!(reparsed.name, "stmt");
    assert_eq!(reparsed.sql, "SELECT 2");
    let mut tail = Vec::new();
    tail.extend_from_slice(&1i16.to_be_bytes());
    tail.extend_from_slice(&23i32.to_be_bytes());
    assert!(rewritten.payload.ends_with(&tail));
}

#[test]
fn row_description_rename_preserves_field_tails() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2i16.to_be_bytes());
    for (name, oid) in [("email", 1i32), ("image_url", 2i32)] {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&oid.to_be_bytes()); // table oid
        payload.extend_from_slice(&1i16.to_be_bytes()); // attnum
        payload.extend_from_slice(&25i32.to_be_bytes()); // type oid
        payload.extend_from_slice(&(-1i16).to_be_bytes()); // type len
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // type mod
        payload.extend_from_slice(&0i16.to_be_bytes()); // format
    }
    let frame = Frame::new(MSG_ROW_DESCRIPTION, payload);

    let mut desc = wire::decode_row_description(&frame).unwrap();
    assert_eq!(desc.field_names().collect::<Vec<_>>(), vec!["email", "image_url"]);

    desc.rename_fields(|name| {
        (name == "image_url").then(|| format!("avatars_{name}"))
    });
    let rewritten = desc.into_frame();

    let reread = wire::decode_row_description(&rewritten).unwrap();
    assert_eq!(
        reread.field_names().collect::<Vec<_>>(),
        vec!["email", "avatars_image_url"]
    );
    // The fixed-size field data must ride along unchanged.
    assert!(rewritten.payload.ends_with(&[
        0, 0, 0, 2, // table oid
        0, 1, // attnum
        0, 0, 0, 25, // type oid
        255, 255, // type len
        255, 255, 255, 255, // type mod
        0, 0, // format
    ]));
}
