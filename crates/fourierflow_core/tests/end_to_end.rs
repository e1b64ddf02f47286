use fourierflow_core::autodiff::{gradient_norm, sgd_step};
use fourierflow_core::traits::Parameterized;
use fourierflow_core::{Field, FourierDeqNet, GridShape, Mode, ModelConfig, Phase};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn turbulence_like_input(shape: GridShape, channels: usize, seed: u64) -> Field {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let phases: Vec<f64> = (0..channels * 4).map(|_| rng.gen_range(0.0..6.283)).collect();
    Field::from_fn(shape, channels, |b, i, j, c| {
        let x = i as f64 / shape.height as f64;
        let y = j as f64 / shape.width as f64;
        let mut value = 0.0;
        for k in 1..=4 {
            let phase = phases[c * 4 + k - 1] + 0.1 * b as f64;
            value += (6.283 * k as f64 * (x + 0.5 * y) + phase).sin() / k as f64;
        }
        value
    })
}

fn paper_config() -> ModelConfig {
    ModelConfig::from_json_str(
        r#"{
            "input_dim": 3,
            "width": 16,
            "n_modes": 8,
            "n_layers": 1,
            "pretraining_steps": 100
        }"#,
    )
    .expect("config should parse")
}

fn half_squared_norm(field: &Field) -> f64 {
    0.5 * field.norm().powi(2)
}

#[test]
fn unrolled_phase_is_deterministic_for_a_fixed_seed() {
    let shape = GridShape::new(4, 32, 32);
    let input = turbulence_like_input(shape, 3, 1);

    let first = FourierDeqNet::new(paper_config(), 42).expect("model");
    let second = FourierDeqNet::new(paper_config(), 42).expect("model");
    let (a, tape) = first.forward(&input, 0, Mode::Training).expect("forward");
    let b = second.predict(&input, 0).expect("predict");

    assert_eq!(tape.phase(), Some(Phase::Unrolled));
    assert_eq!(a, b);
    assert_eq!(a.shape(), shape);
    assert_eq!(a.channels(), 1);
}

#[test]
fn equilibrium_phase_produces_finite_spectral_gradients() {
    let shape = GridShape::new(4, 32, 32);
    let input = turbulence_like_input(shape, 3, 2);
    let model = FourierDeqNet::new(paper_config(), 7).expect("model");

    let (prediction, tape) = model.forward(&input, 200, Mode::Training).expect("forward");
    assert_eq!(tape.phase(), Some(Phase::Equilibrium));
    assert_eq!(prediction.shape(), shape);
    assert_eq!(prediction.channels(), 1);
    assert!(prediction.is_finite());

    let mut grads = model.zeros_like();
    let report = model
        .backward(tape, &prediction, &mut grads)
        .expect("backward should succeed");

    let forward_trace = report.forward_trace.expect("forward solver ran");
    assert!(forward_trace.evaluations >= 1 && forward_trace.evaluations <= 30);
    assert!(report.backward_trace.is_some());
    assert!(report.input_grad.is_finite());
    for weight in &grads.deq.operator.fourier_weight {
        assert_eq!(weight.data.len(), 16 * 16 * 8 * 8 * 2);
        assert!(weight.data.iter().all(|v| v.is_finite()));
    }
    assert!(gradient_norm(&grads) > 0.0);
}

#[test]
fn a_normalised_gradient_step_lowers_the_loss() {
    let shape = GridShape::new(2, 16, 16);
    let input = turbulence_like_input(shape, 3, 3);
    let mut config = paper_config();
    config.n_modes = 4;
    config.n_layers = 2;
    let mut model = FourierDeqNet::new(config, 11).expect("model");

    let (prediction, tape) = model.forward(&input, 0, Mode::Training).expect("forward");
    let before = half_squared_norm(&prediction);
    let mut grads = model.zeros_like();
    model
        .backward(tape, &prediction, &mut grads)
        .expect("backward");

    let norm = gradient_norm(&grads);
    assert!(norm > 0.0);
    sgd_step(&mut model, &grads, 1e-3 / norm).expect("same layout");

    let after = half_squared_norm(&model.predict(&input, 0).expect("predict"));
    assert!(after < before, "loss went from {before} to {after}");
}
