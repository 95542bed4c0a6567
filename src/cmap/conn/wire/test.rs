use pretty_assertions::assert_eq;

use super::message::{Message, MessageFlags};
use crate::bson::doc;

#[tokio::test]
async fn command_carries_db_and_request_id() {
    let message = Message::from_command(doc! { "isMaster": 1, "helloOk": true }, "admin", Some(7));

    let mut bytes: Vec<u8> = Vec::new();
    let request_id = message.write_to(&mut bytes).await.unwrap();
    assert_eq!(request_id, 7);
    assert_eq!(
        i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize,
        bytes.len()
    );
    assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2013);

    let read = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();
    assert_eq!(read.request_id, Some(7));
    assert_eq!(
        read.document_payload,
        doc! { "isMaster": 1, "helloOk": true, "$db": "admin" }
    );
}

#[tokio::test]
async fn document_sequences_and_checksum_are_skipped() {
    let payload = doc! { "ok": 1.0 };
    let mut payload_bytes = Vec::new();
    payload.to_writer(&mut payload_bytes).unwrap();

    let sequence_doc = doc! { "x": 1 };
    let mut sequence_doc_bytes = Vec::new();
    sequence_doc.to_writer(&mut sequence_doc_bytes).unwrap();
    let identifier = b"documents\0";

    let mut body = Vec::new();
    body.extend(MessageFlags::CHECKSUM_PRESENT.bits().to_le_bytes());
    body.push(1);
    body.extend(((4 + identifier.len() + sequence_doc_bytes.len()) as i32).to_le_bytes());
    body.extend(identifier);
    body.extend(&sequence_doc_bytes);
    body.push(0);
    body.extend(&payload_bytes);
    body.extend(0xdeadbeef_u32.to_le_bytes());

    let mut bytes = Vec::new();
    bytes.extend(((16 + body.len()) as i32).to_le_bytes());
    bytes.extend(3_i32.to_le_bytes());
    bytes.extend(9_i32.to_le_bytes());
    bytes.extend(2013_i32.to_le_bytes());
    bytes.extend(body);

    let read = Message::read_from(&mut bytes.as_slice(), None).await.unwrap();
    assert_eq!(read.response_to, 9);
    assert_eq!(read.document_payload, payload);
}

#[tokio::test]
async fn legacy_reply_is_rejected() {
    let mut bytes = Vec::new();
    bytes.extend(16_i32.to_le_bytes());
    bytes.extend(1_i32.to_le_bytes());
    bytes.extend(0_i32.to_le_bytes());
    bytes.extend(1_i32.to_le_bytes());

    let error = Message::read_from(&mut bytes.as_slice(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::InvalidResponse { .. }
    ));
}
