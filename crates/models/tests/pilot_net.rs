use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{ConvLayerSpec, HeadActivation, HeadSpec, PilotNet, PilotNetConfig};

type B = NdArray<f32>;

fn small_config(aux_inputs: usize) -> PilotNetConfig {
    PilotNetConfig {
        input_channels: 3,
        convs: vec![ConvLayerSpec::new(6, 3, 1), ConvLayerSpec::new(8, 3, 1)],
        hidden: 10,
        dropout: 0.0,
        aux_inputs,
        heads: vec![
            HeadSpec::new("angle", 15, HeadActivation::Softmax),
            HeadSpec::new("throttle", 1, HeadActivation::Linear),
        ],
    }
}

#[test]
fn forward_produces_one_tensor_per_head() {
    let device = Default::default();
    let net = PilotNet::<B>::new(&small_config(6), &device);
    let images = Tensor::<B, 4>::zeros([2, 3, 12, 16], &device);
    let aux = Tensor::<B, 2>::ones([2, 6], &device);
    let out = net.forward(images, Some(aux));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dims(), [2, 15]);
    assert_eq!(out[1].dims(), [2, 1]);
    assert_eq!(net.layer_count(), 5);
}

#[test]
fn removing_channels_keeps_the_graph_consistent() {
    let device = Default::default();
    let net = PilotNet::<B>::new(&small_config(4), &device);
    assert_eq!(net.conv_channels(), vec![6, 8]);

    let net = net.remove_channels(0, &[1, 4]).remove_channels(1, &[0, 7, 3]);
    assert_eq!(net.conv_channels(), vec![4, 5]);

    let images = Tensor::<B, 4>::ones([1, 3, 12, 16], &device);
    let out = net.forward(images.clone(), Some(Tensor::<B, 2>::zeros([1, 4], &device)));
    assert_eq!(out[1].dims(), [1, 1]);
    let acts = net.conv_activations(images);
    assert_eq!(acts[0].dims()[1], 4);
    assert_eq!(acts[1].dims()[1], 5);
}

#[test]
fn removing_every_channel_is_refused() {
    let device = Default::default();
    let net = PilotNet::<B>::new(&small_config(0), &device);
    let net = net.remove_channels(0, &[0, 1, 2, 3, 4, 5]);
    assert_eq!(net.conv_channels(), vec![6, 8]);
}
