use criterion::{criterion_group, criterion_main, Criterion};
use undertow_core::torrent::{PeerBitfield, PieceIndex, PieceStore, BLOCK_SIZE};

/// Rarest-first selection over a swarm-sized piece set.
fn bench_piece_selection(c: &mut Criterion) {
    let piece_count = 2048u32;
    let total = piece_count as u64 * BLOCK_SIZE as u64;

    c.bench_function("select_next_blocks_rarest_first", |b| {
        let mut store = PieceStore::new(BLOCK_SIZE, total, vec![[0u8; 20]; piece_count as usize], 42);
        let mut peer = PeerBitfield::new(piece_count);
        for piece in 0..piece_count {
            peer.set_piece(PieceIndex::new(piece));
            if piece % 3 == 0 {
                store.peer_has_piece(PieceIndex::new(piece));
            }
        }

        b.iter(|| {
            let requests = store.select_next_blocks(&peer, 16);
            for request in &requests {
                store.release_request(request);
            }
            requests.len()
        });
    });
}

fn bench_availability_updates(c: &mut Criterion) {
    let piece_count = 2048u32;
    let total = piece_count as u64 * BLOCK_SIZE as u64;

    c.bench_function("apply_peer_bitfield", |b| {
        let mut store = PieceStore::new(BLOCK_SIZE, total, vec![[0u8; 20]; piece_count as usize], 7);
        let mut peer = PeerBitfield::new(piece_count);
        for piece in (0..piece_count).step_by(2) {
            peer.set_piece(PieceIndex::new(piece));
        }

        b.iter(|| {
            store.apply_peer_bitfield(&peer);
            store.remove_peer_bitfield(&peer);
        });
    });
}

criterion_group!(benches, bench_piece_selection, bench_availability_updates);
criterion_main!(benches);
