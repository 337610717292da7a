//! Graph definition of the CIFAR-100 convolutional network.
//!
//! conv(32) → pool → conv(64) → pool → conv(128) → pool → dense(256) →
//! dropout → dense(100) → softmax, all 3×3 kernels with VALID padding.

use tensorflow::ops;
use tensorflow::train::{AdamOptimizer, MinimizeOptions, Optimizer};
use tensorflow::{
    DataType, Operation, Output, OutputName, SavedModelBuilder, SavedModelSaver, Scope, Shape,
    SignatureDef, Status, Tensor, TensorInfo, Variable,
};

use cifar_serve::classifier::{
    INPUT_HEIGHT, INPUT_KEY, INPUT_WIDTH, NUM_CLASSES, OUTPUT_KEY, PREDICT_METHOD, SERVE_TAG,
    SIGNATURE_KEY,
};

/// Probability of keeping a unit of the hidden dense layer while training
pub const KEEP_PROB: f32 = 0.5;

pub const HIDDEN_UNITS: u64 = 256;

/// Keras default for Adam
const LEARNING_RATE: f32 = 0.001;
const CONV_FILTERS: [u64; 3] = [32, 64, 128];

/// 32 → 30 → 15 → 13 → 6 → 4 → 2
const FLAT_UNITS: u64 = 2 * 2 * 128;

/// Handles to the ops the trainer feeds and fetches.
pub struct Network {
    /// `[-1, 32, 32, 3]` float input
    pub images: Operation,
    /// `[-1, 100]` one-hot targets
    pub labels: Operation,
    /// `[-1, 256]` inverted dropout mask, all ones unless fed
    pub dropout_mask: Operation,
    pub probabilities: Operation,
    /// Mean cross-entropy over the batch
    pub loss: Operation,
    pub train_step: Operation,
    /// Model weights; these are what gets exported
    pub variables: Vec<Variable>,
    /// Optimizer slots, initialized but never exported
    pub optimizer_variables: Vec<Variable>,
}

fn shape(dims: &[Option<i64>]) -> Shape {
    Shape::from(Some(dims.to_vec()))
}

fn known(dims: &[u64]) -> Shape {
    Shape::from(Some(dims.iter().map(|&d| Some(d as i64)).collect::<Vec<_>>()))
}

/// He-initialized weight variable
fn weight(dims: &[u64], fan_in: u64, scope: &mut Scope) -> Result<Variable, Status> {
    let extent: Vec<i64> = dims.iter().map(|&d| d as i64).collect();

    let normal = ops::RandomStandardNormal::new()
        .dtype(DataType::Float)
        .build(ops::constant(&extent[..], scope)?, scope)?;
    let stddev = ops::constant((2.0 / fan_in as f32).sqrt(), scope)?;

    Variable::builder()
        .initial_value(ops::mul(normal, stddev, scope)?)
        .data_type(DataType::Float)
        .shape(known(dims))
        .build(&mut scope.with_op_name("w"))
}

fn bias(units: u64, scope: &mut Scope) -> Result<Variable, Status> {
    Variable::builder()
        .const_initial_value(Tensor::<f32>::new(&[units]))
        .build(&mut scope.with_op_name("b"))
}

fn conv_block(
    input: Output,
    in_channels: u64,
    filters: u64,
    scope: &mut Scope,
) -> Result<(Vec<Variable>, Output), Status> {
    let w = weight(&[3, 3, in_channels, filters], 9 * in_channels, scope)?;
    let b = bias(filters, scope)?;

    let conv = ops::Conv2D::new()
        .strides(vec![1i64, 1, 1, 1])
        .padding("VALID")
        .build(input, w.output().clone(), scope)?;
    let activated = ops::relu(ops::bias_add(conv, b.output().clone(), scope)?, scope)?;
    let pooled = ops::MaxPool::new()
        .ksize(vec![1i64, 2, 2, 1])
        .strides(vec![1i64, 2, 2, 1])
        .padding("VALID")
        .build(activated, scope)?;

    Ok((vec![w, b], pooled.into()))
}

fn dense(
    input: Output,
    inputs: u64,
    units: u64,
    scope: &mut Scope,
) -> Result<(Vec<Variable>, Output), Status> {
    let w = weight(&[inputs, units], inputs, scope)?;
    let b = bias(units, scope)?;

    let z = ops::add(
        ops::mat_mul(input, w.output().clone(), scope)?,
        b.output().clone(),
        scope,
    )?;

    Ok((vec![w, b], z.into()))
}

impl Network {
    pub fn build(scope: &mut Scope) -> Result<Self, Status> {
        let classes = NUM_CLASSES as i64;

        let images = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(shape(&[
                None,
                Some(INPUT_HEIGHT as i64),
                Some(INPUT_WIDTH as i64),
                Some(3),
            ]))
            .build(&mut scope.with_op_name("images"))?;

        let labels = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(shape(&[None, Some(classes)]))
            .build(&mut scope.with_op_name("labels"))?;

        let ones = Tensor::<f32>::new(&[1, HIDDEN_UNITS])
            .with_values(&vec![1.0f32; HIDDEN_UNITS as usize])?;
        let dropout_mask = ops::PlaceholderWithDefault::new()
            .shape(shape(&[None, Some(HIDDEN_UNITS as i64)]))
            .build(
                ops::constant(ones, scope)?,
                &mut scope.with_op_name("dropout_mask"),
            )?;

        let mut variables = Vec::new();
        let mut x: Output = images.clone().into();
        let mut channels = 3;

        for (i, &filters) in CONV_FILTERS.iter().enumerate() {
            let (vars, out) = conv_block(
                x,
                channels,
                filters,
                &mut scope.new_sub_scope(&format!("conv{}", i + 1)),
            )?;
            variables.extend(vars);
            x = out;
            channels = filters;
        }

        let flat = ops::reshape(
            x,
            ops::constant(&[-1i64, FLAT_UNITS as i64][..], scope)?,
            scope,
        )?;

        let (vars, hidden) = dense(
            flat.into(),
            FLAT_UNITS,
            HIDDEN_UNITS,
            &mut scope.new_sub_scope("dense"),
        )?;
        variables.extend(vars);

        let hidden = ops::relu(hidden, scope)?;
        let dropped = ops::mul(hidden, dropout_mask.clone(), scope)?;

        let (vars, logits) = dense(
            dropped.into(),
            HIDDEN_UNITS,
            NUM_CLASSES as u64,
            &mut scope.new_sub_scope("logits"),
        )?;
        variables.extend(vars);

        let probabilities = ops::softmax(logits.clone(), &mut scope.with_op_name("probabilities"))?;

        let xent = ops::SoftmaxCrossEntropyWithLogits::new().build(
            logits,
            labels.clone(),
            scope,
        )?;
        let loss = ops::mean(
            Output {
                operation: xent,
                index: 0,
            },
            ops::constant(&[0i32][..], scope)?,
            &mut scope.with_op_name("loss"),
        )?;

        let mut optimizer = AdamOptimizer::new();
        optimizer.set_learning_rate(ops::constant(LEARNING_RATE, scope)?);
        let (optimizer_variables, train_step) = optimizer.minimize(
            scope,
            loss.clone().into(),
            MinimizeOptions::default().with_variables(&variables),
        )?;

        Ok(Network {
            images,
            labels,
            dropout_mask,
            probabilities,
            loss,
            train_step,
            variables,
            optimizer_variables,
        })
    }

    /// Adds save ops exporting the weights under the serving signature.
    pub fn saver(&self, scope: &mut Scope) -> Result<SavedModelSaver, Status> {
        let mut signature = SignatureDef::new(PREDICT_METHOD.to_string());
        signature.add_input_info(
            INPUT_KEY.to_string(),
            TensorInfo::new(
                DataType::Float,
                shape(&[
                    None,
                    Some(INPUT_HEIGHT as i64),
                    Some(INPUT_WIDTH as i64),
                    Some(3),
                ]),
                OutputName {
                    name: self.images.name()?,
                    index: 0,
                },
            ),
        );
        signature.add_output_info(
            OUTPUT_KEY.to_string(),
            TensorInfo::new(
                DataType::Float,
                shape(&[None, Some(NUM_CLASSES as i64)]),
                OutputName {
                    name: self.probabilities.name()?,
                    index: 0,
                },
            ),
        );

        let mut builder = SavedModelBuilder::new();
        builder
            .add_collection("variables", &self.variables)
            .add_tag(SERVE_TAG)
            .add_signature(SIGNATURE_KEY, signature);

        builder.inject(scope)
    }
}
