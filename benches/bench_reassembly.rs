use braid_proxy_lib::mux::reassembly::ReassemblyQueue;
use braid_proxy_lib::{BlockHeader, Flags};
use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;

const BLOCK_LEN: u16 = 512;
const BLOCKS: u32 = 256;

fn blocks(shuffled: bool) -> Vec<(BytesMut, BlockHeader)> {
    let mut out: Vec<(BytesMut, BlockHeader)> = (0..BLOCKS)
        .map(|i| {
            let offset = i * BLOCK_LEN as u32;
            let mut flags = Flags::empty();
            if i == 0 {
                flags |= Flags::SYN;
            }
            if i == BLOCKS - 1 {
                flags |= Flags::FIN;
            }
            let hdr = BlockHeader { circuit_id: 1, offset, length: BLOCK_LEN, flags };
            (BytesMut::from(&vec![i as u8; BLOCK_LEN as usize][..]), hdr)
        })
        .collect();
    if shuffled {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        out.shuffle(&mut rng);
    }
    out
}

fn reassemble(input: Vec<(BytesMut, BlockHeader)>) -> usize {
    let mut queue = ReassemblyQueue::new();
    for (payload, hdr) in input {
        queue.insert(payload, &hdr).expect("valid block");
    }
    let mut recv_offset = 0u32;
    let mut delivered = 0;
    while let Some(seg) = queue.pop_ready(recv_offset, true) {
        recv_offset = recv_offset.wrapping_add(seg.len());
        delivered += seg.len() as usize;
    }
    delivered
}

fn bench_reassembly(c: &mut Criterion) {
    c.bench_function("reassemble_in_order", |b| {
        b.iter_batched(|| blocks(false), reassemble, BatchSize::SmallInput)
    });
    c.bench_function("reassemble_shuffled", |b| {
        b.iter_batched(|| blocks(true), reassemble, BatchSize::SmallInput)
    });
}

criterion_group!(benches, bench_reassembly);
criterion_main!(benches);
