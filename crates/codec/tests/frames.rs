use bytes::BytesMut;
use veil_sdk_codec::{ContentType, Message, Pool, header};

fn data_frame(conn: u32, seq: u32, body: &[u8]) -> Message {
    Message::new(ContentType::Data)
        .with_u32(header::CONN_ID, conn)
        .with_u32(header::SEQ, seq)
        .with_body(body.to_vec())
}

/// Feeds a wire buffer to the decoder the way a transport would: in
/// arbitrary small chunks, draining complete frames as they appear.
fn drain_in_chunks(wire: &[u8], chunk: usize) -> Vec<Message> {
    let mut accum = BytesMut::new();
    let mut out = Vec::new();

    for piece in wire.chunks(chunk) {
        accum.extend_from_slice(piece);

        while let Some(size) = Message::message_size(&accum).unwrap() {
            if accum.len() < size {
                break;
            }

            let frame = accum.split_to(size);
            out.push(Message::decode(&frame).unwrap());
        }
    }

    assert!(accum.is_empty(), "{} trailing bytes", accum.len());
    out
}

#[test]
fn reassembly_survives_any_chunking() {
    let messages = [
        data_frame(1, 1, b"first"),
        data_frame(2, 1, b""),
        data_frame(1, 2, &[0xAB; 300]),
        Message::new(ContentType::StateClosed).with_u32(header::CONN_ID, 2),
    ];

    let mut wire = BytesMut::new();
    for msg in &messages {
        msg.encode(&mut wire).unwrap();
    }

    for chunk in [1, 3, 7, 64, wire.len()] {
        let decoded = drain_in_chunks(&wire, chunk);
        assert_eq!(decoded.len(), messages.len(), "chunk size {}", chunk);
        for (got, want) in decoded.iter().zip(&messages) {
            assert_eq!(got, want);
        }
    }
}

#[test]
fn frames_for_different_conns_interleave() {
    let mut wire = BytesMut::new();
    for i in 0..10u32 {
        data_frame(i % 3, i, format!("payload-{}", i).as_bytes()).encode(&mut wire).unwrap();
    }

    let decoded = drain_in_chunks(&wire, 5);
    let for_conn_1: Vec<u32> = decoded
        .iter()
        .filter(|m| m.conn_id() == Some(1))
        .map(|m| m.edge_seq().unwrap())
        .collect();

    // per-connection order is the wire order
    assert_eq!(for_conn_1, [1, 4, 7]);
}

#[test]
fn pool_exhaustion_is_the_backpressure_signal() {
    let pool = Pool::new(1024, 4);

    let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    assert!(pool.acquire().is_none());

    drop(held);
    assert_eq!(pool.available(), 4);
}
