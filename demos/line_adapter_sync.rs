// Draws two rectangles twice. Each line is converted into points only once; the
// second drawing reuses the cached points.
//
// Run with: `RUST_LOG=debug cargo run --example line_adapter_sync`

use keyed_lazy_cache::sync::Cache;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Point {
    x: i32,
    y: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Line {
    start: Point,
    end: Point,
}

struct VectorRectangle {
    lines: [Line; 4],
}

impl VectorRectangle {
    fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        let p = |x, y| Point { x, y };
        let line = |start, end| Line { start, end };
        Self {
            lines: [
                line(p(x, y), p(x + width, y)),
                line(p(x, y), p(x, y + height)),
                line(p(x + width, y), p(x + width, y + height)),
                line(p(x, y + height), p(x + width, y + height)),
            ],
        }
    }
}

static ADAPTED: AtomicUsize = AtomicUsize::new(0);

fn to_points(line: &Line) -> Arc<Vec<Point>> {
    let n = ADAPTED.fetch_add(1, Ordering::AcqRel) + 1;
    println!(
        "[{n}] Adapting line ({}, {})-({}, {})",
        line.start.x, line.start.y, line.end.x, line.end.y
    );

    let (left, right) = (line.start.x.min(line.end.x), line.start.x.max(line.end.x));
    let (bottom, top) = (line.start.y.min(line.end.y), line.start.y.max(line.end.y));
    let points = if left == right {
        (bottom..=top).map(|y| Point { x: left, y }).collect()
    } else if bottom == top {
        (left..=right).map(|x| Point { x, y: bottom }).collect()
    } else {
        Vec::new()
    };
    Arc::new(points)
}

fn draw(shapes: &[VectorRectangle], adapter: &Cache<Line, Arc<Vec<Point>>>) -> usize {
    let mut dots = 0;
    for line in shapes.iter().flat_map(|s| s.lines.iter()) {
        dots += adapter.get_with(*line, || to_points(line)).len();
    }
    dots
}

fn main() {
    env_logger::init();

    let shapes = [
        VectorRectangle::new(1, 1, 10, 10),
        VectorRectangle::new(3, 3, 6, 6),
    ];
    let adapter = Cache::builder()
        .name("line-to-points")
        .record_stats()
        .build();

    println!("First drawing: {} dots", draw(&shapes, &adapter));
    println!("Second drawing: {} dots", draw(&shapes, &adapter));

    assert_eq!(ADAPTED.load(Ordering::Acquire), 8);
    println!("{:#?}", adapter.stats());
}
