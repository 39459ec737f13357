// Full-pipeline scenarios driven through the public Network surface.

use neural_engine::layers::ActivationKind;
use neural_engine::loss::MeanSquaredError;
use neural_engine::network::Network;
use neural_engine::shape::Shape;

fn network(seed: u64, learning_rate: f32) -> Network {
    Network::new(Box::new(MeanSquaredError::new()), learning_rate, seed)
}

#[test]
fn test_mean_filter_convolution() {
    // A 3x3 convolution with every coefficient 1/9 over a 3x3 input produces
    // a single value equal to the input mean.
    let mut net = network(1, 0.01);
    net.add_input(Shape::new(3, 3, 1)).add_convolution(3, 1, 1);
    net.startup(1).unwrap();

    net.weights()[0].load(&vec![1.0 / 9.0; 9]).unwrap();
    net.weights()[1].load(&[0.0]).unwrap();

    let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let outputs = net.generate(&[input]).unwrap();
    assert_eq!(outputs[0].len(), 1);
    assert!((outputs[0][0] - 5.0).abs() < 1e-5);
}

#[test]
fn test_dense_sums_with_unit_weights() {
    let mut net = network(2, 0.01);
    net.add_input(Shape::new(3, 1, 1)).add_dense(1);
    net.startup(1).unwrap();

    net.weights()[0].load(&[1.0, 1.0, 1.0]).unwrap();
    net.weights()[1].load(&[0.0]).unwrap();

    let outputs = net.generate(&[vec![1.0, 2.0, 3.0]]).unwrap();
    assert!((outputs[0][0] - 6.0).abs() < 1e-5);
}

#[test]
fn test_batch_norm_zero_variance_stays_finite() {
    // A batch of two identical constant feature maps has zero variance; the
    // epsilon floor keeps normalization finite and every output collapses to
    // beta (zero).
    let mut net = network(3, 0.01);
    net.add_input(Shape::new(2, 2, 1)).add_batch_norm();
    net.startup(2).unwrap();

    let outputs = net.generate(&[vec![3.0; 4], vec![3.0; 4]]).unwrap();
    for output in &outputs {
        assert!(output.iter().all(|v| v.is_finite()));
        assert!(output.iter().all(|v| v.abs() < 1e-5));
    }
}

#[test]
fn test_convolution_transpose_inverts_shape() {
    // Downsample with (filter 4, stride 2), upsample with the same pair:
    // the spatial extent returns to the original 10x10.
    let mut net = network(4, 0.01);
    net.add_input(Shape::new(10, 10, 1))
        .add_convolution(4, 2, 3)
        .add_trans_conv(4, 2, 1);
    net.startup(1).unwrap();
    assert_eq!(net.output_shape(), Some(Shape::new(10, 10, 1)));

    let outputs = net.generate(&[vec![0.5; 100]]).unwrap();
    assert_eq!(outputs[0].len(), 100);
}

#[test]
fn test_zero_learning_rate_is_bit_identical() {
    // Full forward/backward/update machinery runs, but a zero step size must
    // leave every weight exactly as initialized.
    let mut net = network(5, 0.0);
    net.add_input(Shape::new(4, 4, 1))
        .add_convolution(3, 1, 2)
        .add_activation(ActivationKind::Tanh)
        .add_dense(2);
    net.startup(2).unwrap();

    let before = net.weight_snapshots();
    let inputs = vec![vec![0.25f32; 16], vec![0.75f32; 16]];
    let expected = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    for _ in 0..20 {
        let (loss, _) = net.train(&inputs, &expected, true).unwrap();
        assert!(loss > 0.0);
    }
    assert_eq!(net.weight_snapshots(), before);
}

#[test]
fn test_autoencoder_topology_trains() {
    // Pool down, push through a skip connection, upsample back: exercises
    // every structural layer in one pipeline and confirms the loss falls.
    let mut net = network(6, 0.02);
    net.add_input(Shape::new(4, 4, 1))
        .add_skip_out(0)
        .add_avg_pool(2)
        .add_activation(ActivationKind::LeakyRelu { alpha: 0.1 })
        .add_upsample(2)
        .add_concatenation(0)
        .add_convolution(1, 1, 1)
        .add_reshape(Shape::new(16, 1, 1));
    net.startup(2).unwrap();
    assert_eq!(net.output_shape(), Some(Shape::new(16, 1, 1)));

    let inputs = vec![vec![0.2f32; 16], vec![0.8f32; 16]];
    let expected = inputs.clone();

    let (initial, _) = net.test(&inputs, &expected).unwrap();
    for _ in 0..100 {
        net.train(&inputs, &expected, true).unwrap();
    }
    let (trained, _) = net.test(&inputs, &expected).unwrap();
    assert!(
        trained < initial,
        "reconstruction loss did not improve: {} -> {}",
        initial,
        trained
    );
}
