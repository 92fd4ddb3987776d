use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio_util::codec::Decoder;

use meshcoord::commandclass::send_data;
use meshcoord::protocol::{encode_frame, Direction, LinkCodec, Message, MessageClass, Priority};
use meshcoord::NodeId;

fn bench_encode(c: &mut Criterion) {
    let mut message = send_data(NodeId(7), &[0x25, 0x01, 0xFF], Some(MessageClass::SendData), Priority::Set).unwrap();
    message.callback_id = 0x2A;
    message.transmit_options = 0x25;
    c.bench_function("encode_send_data", |b| b.iter(|| encode_frame(black_box(&message))));
}

fn bench_decode_stream(c: &mut Criterion) {
    let reply = Message::incoming(MessageClass::GetVersion, Direction::Response, b"Z-Wave 2.78\0\x01".to_vec());
    let frame = encode_frame(&reply).unwrap();
    let mut stream = Vec::new();
    for _ in 0..64 {
        stream.push(0x06);
        stream.extend_from_slice(&frame);
    }

    c.bench_function("decode_mixed_stream", |b| {
        b.iter(|| {
            let mut codec = LinkCodec::new();
            let mut buf = BytesMut::from(&stream[..]);
            let mut frames = 0;
            while let Ok(Some(_)) = codec.decode(&mut buf) {
                frames += 1;
            }
            black_box(frames)
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
