// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use conmgr::rpc::{examine, Frame, LENGTH_PREFIX};
use conmgr::tls::fingerprint;

const MAX_MSG_SIZE: u32 = 128 * 1024;

fn build_wire(frames: usize, payload: usize) -> Vec<u8> {
    let mut wire = Vec::with_capacity(frames * (LENGTH_PREFIX + payload));
    for index in 0..frames {
        wire.extend_from_slice(&(payload as u32).to_be_bytes());
        wire.extend(std::iter::repeat((index & 0xff) as u8).take(payload));
    }
    wire
}

fn reassemble(wire: &[u8], chunk: usize) -> usize {
    let mut buffered = Vec::with_capacity(chunk * 2);
    let mut frames = 0;

    for piece in wire.chunks(chunk) {
        buffered.extend_from_slice(piece);
        while let Frame::Payload(len) = examine(&buffered, MAX_MSG_SIZE) {
            black_box(&buffered[LENGTH_PREFIX..LENGTH_PREFIX + len]);
            buffered.drain(..LENGTH_PREFIX + len);
            frames += 1;
        }
    }

    frames
}

fn bench_reassembly(c: &mut Criterion) {
    let wire = build_wire(64, 512);

    let mut group = c.benchmark_group("frame_reassembly");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    for chunk in [16usize, 512, 4096] {
        group.bench_function(format!("chunk_{chunk}"), |b| {
            b.iter(|| {
                let frames = reassemble(black_box(&wire), chunk);
                assert_eq!(64, frames);
            })
        });
    }
    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let tls = [0x16u8, 0x03, 0x03, 0x00, 0x05, 0x01];
    let rpc = [0x00u8, 0x00, 0x00, 0x07, 0xaa, 0xbb];

    c.bench_function("fingerprint_tls", |b| {
        b.iter(|| fingerprint(black_box(&tls)))
    });
    c.bench_function("fingerprint_rpc", |b| {
        b.iter(|| fingerprint(black_box(&rpc)))
    });
}

criterion_group!(benches, bench_reassembly, bench_fingerprint);
criterion_main!(benches);
