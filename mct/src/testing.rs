//! Small seeded graphs used by unit and integration tests.

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::graph::{
    AttrValue, Edge, Graph, GraphError, Node, NodeId, OpType, Shape, WeightTensor, ACTIVATION_ATTR, BETA,
    BIAS, EPSILON, GAMMA, KERNEL, MOVING_MEAN, MOVING_VARIANCE,
};

pub fn random_weight(shape: Shape, rng: &mut impl Rng) -> Result<WeightTensor, GraphError> {
    let len = shape.iter().product::<usize>();
    WeightTensor::new(shape, (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect_vec())
}

/// A kernel op with seeded random weights. Convolutions run on `[1, 3, 8, 8]`-ish inputs and
/// dense layers on `[1, 16]`.
pub fn kernel_node(op: OpType, activation: &str) -> Result<Node, GraphError> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let node = match op {
        OpType::Conv2d => Node::new("conv", op, vec![vec![1, 3, 8, 8]], vec![vec![1, 4, 8, 8]])
            .with_attribute("strides", AttrValue::Ints(vec![1, 1]))
            .with_attribute("padding", "same")
            .with_weight(KERNEL, random_weight(vec![4, 3, 3, 3], &mut rng)?)
            .with_weight(BIAS, random_weight(vec![4], &mut rng)?),
        OpType::ConvTranspose2d => Node::new("conv_transpose", op, vec![vec![1, 4, 8, 8]], vec![
            vec![1, 3, 16, 16],
        ])
        .with_attribute("strides", AttrValue::Ints(vec![2, 2]))
        .with_weight(KERNEL, random_weight(vec![3, 4, 2, 2], &mut rng)?),
        OpType::Dense => Node::new("dense", op, vec![vec![1, 16]], vec![vec![1, 8]])
            .with_attribute("use_bias", true)
            .with_weight(KERNEL, random_weight(vec![8, 16], &mut rng)?)
            .with_weight(BIAS, random_weight(vec![8], &mut rng)?),
        _ => Node::new(op.to_string(), op, vec![vec![1, 8]], vec![vec![1, 8]]),
    };
    Ok(node.with_attribute(ACTIVATION_ATTR, activation))
}

/// A graph made of one kernel op, whose output is the graph output
pub fn single_kernel_graph(op: OpType, activation: &str) -> Result<(Graph, NodeId), GraphError> {
    let mut graph = Graph::new();
    let id = graph.add_node(kernel_node(op, activation)?);
    graph.add_output(id, 0)?;
    Ok((graph, id))
}

/// `input -> kernel op`, the kernel output being the graph output
pub fn input_then_kernel_graph(
    op: OpType,
    activation: &str,
) -> Result<(Graph, NodeId), GraphError> {
    let mut graph = Graph::new();
    let node = kernel_node(op, activation)?;
    let input = graph.add_node(Node::new(
        "input",
        OpType::Input,
        vec![],
        node.input_shapes.clone(),
    ));
    let id = graph.add_node(node);
    graph.add_edge(Edge::single(input, id))?;
    graph.add_output(id, 0)?;
    Ok((graph, id))
}

pub fn batch_norm_node(
    name: &str,
    shape: Shape,
    rng: &mut ChaCha8Rng,
) -> Result<Node, GraphError> {
    let channels = shape[1];
    let positive = |rng: &mut ChaCha8Rng| {
        (0..channels)
            .map(|_| rng.gen_range(0.5f32..1.5))
            .collect_vec()
    };
    Ok(Node::new(name, OpType::BatchNorm, vec![shape.clone()], vec![shape])
        .with_attribute(EPSILON, 1e-3)
        .with_weight(GAMMA, WeightTensor::vector(positive(rng)))
        .with_weight(BETA, random_weight(vec![channels], rng)?)
        .with_weight(MOVING_MEAN, random_weight(vec![channels], rng)?)
        .with_weight(MOVING_VARIANCE, WeightTensor::vector(positive(rng))))
}

/// `input -> conv -> bn -> identity -> relu -> flatten -> dense(softmax)`
pub fn conv_bn_graph() -> Result<Graph, GraphError> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut graph = Graph::new();
    let input = graph.add_node(Node::new("input", OpType::Input, vec![], vec![vec![
        1, 3, 8, 8,
    ]]));
    let conv = graph.add_node(kernel_node(OpType::Conv2d, "linear")?);
    let bn = graph.add_node(batch_norm_node("bn", vec![1, 4, 8, 8], &mut rng)?);
    let identity = graph.add_node(Node::new(
        "identity",
        OpType::Identity,
        vec![vec![1, 4, 8, 8]],
        vec![vec![1, 4, 8, 8]],
    ));
    let relu = graph.add_node(
        Node::new("relu", OpType::Activation, vec![vec![1, 4, 8, 8]], vec![vec![
            1, 4, 8, 8,
        ]])
        .with_attribute(ACTIVATION_ATTR, "relu"),
    );
    let flatten = graph.add_node(Node::new(
        "flatten",
        OpType::Flatten,
        vec![vec![1, 4, 8, 8]],
        vec![vec![1, 256]],
    ));
    let dense = graph.add_node(
        Node::new("dense", OpType::Dense, vec![vec![1, 256]], vec![vec![1, 10]])
            .with_attribute(ACTIVATION_ATTR, "softmax")
            .with_weight(KERNEL, random_weight(vec![10, 256], &mut rng)?)
            .with_weight(BIAS, random_weight(vec![10], &mut rng)?),
    );
    for (a, b) in [input, conv, bn, identity, relu, flatten, dense]
        .into_iter()
        .tuple_windows()
    {
        graph.add_edge(Edge::single(a, b))?;
    }
    graph.add_output(dense, 0)?;
    Ok(graph)
}
