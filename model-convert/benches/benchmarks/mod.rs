pub mod bench_runtime;
pub mod bench_torch;

use model_convert::onnx_format::builder::{int_attribute, ints_attribute, node, GraphBuilder};
use model_convert::onnx_format::ModelProto;

/// Two conv blocks over a 64x64 RGB image followed by a dense classifier.
pub fn conv_classifier() -> ModelProto {
    let mut conv1 = node("Conv", &["x", "w1", "b1"], &["c1"]);
    conv1.attribute.push(ints_attribute("kernel_shape", &[3, 3]));
    conv1.attribute.push(ints_attribute("pads", &[1, 1, 1, 1]));
    let mut pool = node("MaxPool", &["r1"], &["p1"]);
    pool.attribute.push(ints_attribute("kernel_shape", &[2, 2]));
    pool.attribute.push(ints_attribute("strides", &[2, 2]));
    let mut conv2 = node("Conv", &["p1", "w2", "b2"], &["c2"]);
    conv2.attribute.push(ints_attribute("kernel_shape", &[3, 3]));
    conv2.attribute.push(ints_attribute("pads", &[1, 1, 1, 1]));
    let mut flatten = node("Flatten", &["g"], &["f"]);
    flatten.attribute.push(int_attribute("axis", 1));

    GraphBuilder::new(13)
        .input("x", &[-1, 3, 64, 64])
        .output("y", &[-1, 10])
        .initializer("w1", &[16, 3, 3, 3], weights(16 * 3 * 9))
        .initializer("b1", &[16], weights(16))
        .initializer("w2", &[32, 16, 3, 3], weights(32 * 16 * 9))
        .initializer("b2", &[32], weights(32))
        .initializer("fc", &[32, 10], weights(320))
        .node(conv1)
        .node(node("Relu", &["c1"], &["r1"]))
        .node(pool)
        .node(conv2)
        .node(node("Relu", &["c2"], &["r2"]))
        .node(node("GlobalAveragePool", &["r2"], &["g"]))
        .node(flatten)
        .node(node("Gemm", &["f", "fc"], &["y"]))
        .build()
}

fn weights(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i % 17) as f32 - 8.0) * 0.01).collect()
}
