use ndarray::Array4;
use perf_berry::prelude::*;

#[test]
fn test_baseline_mean_is_zero() {
    let data = Array4::from_shape_fn((6, 4, 3, 12), |(x, y, z, t)| {
        50.0 + (x + y + z) as f32 + if t >= 3 { (t * t) as f32 } else { t as f32 * 0.5 }
    });
    let volume = PerfVolume::new(data, Grid::unit());
    let pool = WorkerPool::new(3);
    let out = CurveNormaliseProcess::new(&pool)
        .run_sync(&volume, &CurveNormaliseOptions::default())
        .unwrap();
    pool.shutdown();

    for x in 0..6 {
        let c = out.curve_at((x, 2, 1));
        let baseline: f32 = c.iter().take(3).sum::<f32>() / 3.0;
        assert!(baseline.abs() < 1e-4, "x = {x}: {baseline}");
    }
}

#[test]
fn test_enhancement_mode() {
    let data = Array4::from_shape_fn((2, 2, 2, 6), |(_, _, _, t)| if t < 3 { 10.0 } else { 20.0 });
    let volume = PerfVolume::new(data, Grid::unit());
    let pool = WorkerPool::new(2);
    let opts = CurveNormaliseOptions {
        mode: BaselineMode::Enhancement,
        ..Default::default()
    };
    let out = CurveNormaliseProcess::new(&pool).run_sync(&volume, &opts).unwrap();
    pool.shutdown();
    let c = out.curve_at((1, 1, 1));
    assert!(c[0].abs() < 1e-3);
    assert!((c[5] - 1.0).abs() < 1e-3);
}
