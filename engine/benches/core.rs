use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chess::{Board, Move, MoveFlag, Square};
use engine::types::Bound;
use engine::{SearchWorker, TranspositionTable};
use nnue::Networks;

fn init_logging() {
    use simplelog::{Config, LevelFilter, SimpleLogger};
    let _ = SimpleLogger::init(LevelFilter::Info, Config::default());
}

fn bench_tt(c: &mut Criterion) {
    init_logging();
    let mut group = c.benchmark_group("tt");

    let mut tt = TranspositionTable::new();
    tt.resize(16, 1);
    tt.new_search();

    let board = Board::default();
    let key = board.key();

    group.bench_function("probe_empty", |b| {
        b.iter(|| tt.probe(black_box(key)));
    });

    let (_, _, writer) = tt.probe(key);
    writer.write(
        key,
        42,
        true,
        Bound::Exact,
        10,
        Move::new(Square::E2, Square::E4, MoveFlag::DoublePawnPush),
        17,
        tt.generation(),
    );

    group.bench_function("probe_hit", |b| {
        b.iter(|| tt.probe(black_box(key)));
    });

    group.bench_function("write", |b| {
        b.iter(|| {
            let (_, _, writer) = tt.probe(black_box(key));
            writer.write(key, 42, true, Bound::Exact, 10, Move::NONE, 17, tt.generation());
        });
    });

    group.finish();
}

fn bench_accumulator(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulator");

    let networks = Networks::zeroed();
    let mut worker = SearchWorker::new(0, &networks);
    let mut board = Board::default();
    let _ = worker.evaluate(&board, &networks);

    let mv = Move::new(Square::G1, Square::F3, MoveFlag::QuietMove);

    group.bench_function("push_evaluate_pop", |b| {
        b.iter(|| {
            board.make_move(black_box(mv));
            worker.push(&board);
            let v = worker.evaluate(&board, &networks);
            worker.pop();
            board.unmake_move(mv);
            v
        });
    });

    group.finish();
}

criterion_group!(benches, bench_tt, bench_accumulator);
criterion_main!(benches);
