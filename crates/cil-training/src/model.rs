//! Backbone plus growable linear head.
//!
//! The backbone is either a two-layer MLP over flat inputs or a small CNN over
//! CHW images. Inputs always arrive flattened as `[batch, numel]`; the CNN
//! reshapes them itself. The head grows with [`IncrementalNet::update_fc`],
//! keeping the weights of classes it already knows.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use cil_core::{BackboneKind, Error, InputShape};

/// Configuration for the incremental network
#[derive(Config, Debug)]
pub struct NetConfig {
    pub backbone: BackboneKind,
    pub input: InputShape,

    /// Hidden width of the MLP backbone
    #[config(default = "64")]
    pub hidden_dim: usize,

    /// Feature dimension of the MLP backbone
    #[config(default = "32")]
    pub feature_dim: usize,

    /// Channels of the first CNN stage (the second stage doubles it)
    #[config(default = "16")]
    pub base_channels: usize,
}

impl NetConfig {
    pub fn validate(&self) -> cil_core::Result<()> {
        if let (BackboneKind::Cnn, InputShape::Flat(_)) = (self.backbone, self.input) {
            return Err(Error::Config(
                "the cnn backbone needs image inputs; use convnet_type = \"mlp\" for flat features"
                    .to_string(),
            ));
        }
        if let InputShape::Image { height, width, .. } = self.input {
            if height < 4 || width < 4 {
                return Err(Error::Config(format!(
                    "cnn inputs must be at least 4x4, got {}x{}",
                    height, width
                )));
            }
        }
        if self.hidden_dim == 0 || self.feature_dim == 0 || self.base_channels == 0 {
            return Err(Error::Config("network sizes must be positive".to_string()));
        }
        Ok(())
    }
}

/// Fully-connected backbone
#[derive(Module, Debug)]
pub struct MlpBackbone<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    relu: Relu,
}

impl<B: Backend> MlpBackbone<B> {
    fn new(input_dim: usize, config: &NetConfig, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(input_dim, config.hidden_dim).init(device),
            fc2: LinearConfig::new(config.hidden_dim, config.feature_dim).init(device),
            relu: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.fc1.forward(x));
        self.relu.forward(self.fc2.forward(x))
    }
}

/// Convolution without bias followed by batch norm, the usual network stem
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    relu: Relu,
}

/// Conv2d, BatchNorm, ReLU and 2x2 max pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn.forward(self.conv.forward(x)));
        self.pool.forward(x)
    }
}

/// Convolutional backbone over CHW images
#[derive(Module, Debug)]
pub struct CnnBackbone<B: Backend> {
    pub conv1: Stem<B>,
    pub layer1: ConvBlock<B>,
    pub layer2: ConvBlock<B>,
    pool: AdaptiveAvgPool2d,
    channels: usize,
    height: usize,
    width: usize,
}

impl<B: Backend> CnnBackbone<B> {
    fn new(channels: usize, height: usize, width: usize, base: usize, device: &B::Device) -> Self {
        let conv1 = Stem {
            conv: Conv2dConfig::new([channels, base], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(base).init(device),
            relu: Relu::new(),
        };
        Self {
            conv1,
            layer1: ConvBlock::new(base, base, device),
            layer2: ConvBlock::new(base, base * 2, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            channels,
            height,
            width,
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = x.dims();
        let x = x.reshape([batch, self.channels, self.height, self.width]);
        let x = self
            .conv1
            .relu
            .forward(self.conv1.bn.forward(self.conv1.conv.forward(x)));
        let x = self.layer2.forward(self.layer1.forward(x));
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }
}

/// Feature extractor variants
#[derive(Module, Debug)]
pub enum ConvNet<B: Backend> {
    Mlp(MlpBackbone<B>),
    Cnn(CnnBackbone<B>),
}

impl<B: Backend> ConvNet<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            ConvNet::Mlp(mlp) => mlp.forward(x),
            ConvNet::Cnn(cnn) => cnn.forward(x),
        }
    }
}

/// A parameter or buffer tensor of any rank used by the network.
#[derive(Debug, Clone)]
pub enum ParamTensor<B: Backend> {
    D1(Tensor<B, 1>),
    D2(Tensor<B, 2>),
    D4(Tensor<B, 4>),
}

impl<B: Backend> ParamTensor<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            ParamTensor::D1(t) => t.dims().to_vec(),
            ParamTensor::D2(t) => t.dims().to_vec(),
            ParamTensor::D4(t) => t.dims().to_vec(),
        }
    }

    pub fn flatten(self) -> Tensor<B, 1> {
        match self {
            ParamTensor::D1(t) => t,
            ParamTensor::D2(t) => t.flatten(0, 1),
            ParamTensor::D4(t) => t.flatten(0, 3),
        }
    }
}

impl<B: AutodiffBackend> ParamTensor<B> {
    /// Flattened gradient of this tensor, if it took part in the backward pass.
    pub fn flat_grad(&self, grads: &B::Gradients) -> Option<Tensor<B::InnerBackend, 1>> {
        match self {
            ParamTensor::D1(t) => t.grad(grads),
            ParamTensor::D2(t) => t.grad(grads).map(|g| g.flatten(0, 1)),
            ParamTensor::D4(t) => t.grad(grads).map(|g| g.flatten(0, 3)),
        }
    }
}

/// Whether a named tensor is trained or only tracked (batch-norm statistics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Learnable,
    Buffer,
}

#[derive(Debug, Clone)]
pub struct NamedTensor<B: Backend> {
    pub name: String,
    pub role: TensorRole,
    pub tensor: ParamTensor<B>,
}

impl<B: Backend> NamedTensor<B> {
    fn learnable(name: impl Into<String>, tensor: ParamTensor<B>) -> Self {
        Self {
            name: name.into(),
            role: TensorRole::Learnable,
            tensor,
        }
    }

    fn buffer(name: impl Into<String>, tensor: ParamTensor<B>) -> Self {
        Self {
            name: name.into(),
            role: TensorRole::Buffer,
            tensor,
        }
    }
}

fn linear_tensors<B: Backend>(prefix: &str, linear: &Linear<B>, out: &mut Vec<NamedTensor<B>>) {
    out.push(NamedTensor::learnable(
        format!("{prefix}.weight"),
        ParamTensor::D2(linear.weight.val()),
    ));
    if let Some(bias) = &linear.bias {
        out.push(NamedTensor::learnable(
            format!("{prefix}.bias"),
            ParamTensor::D1(bias.val()),
        ));
    }
}

fn conv_tensors<B: Backend>(prefix: &str, conv: &Conv2d<B>, out: &mut Vec<NamedTensor<B>>) {
    out.push(NamedTensor::learnable(
        format!("{prefix}.weight"),
        ParamTensor::D4(conv.weight.val()),
    ));
    if let Some(bias) = &conv.bias {
        out.push(NamedTensor::learnable(
            format!("{prefix}.bias"),
            ParamTensor::D1(bias.val()),
        ));
    }
}

fn norm_tensors<B: Backend>(prefix: &str, bn: &BatchNorm<B, 2>, out: &mut Vec<NamedTensor<B>>) {
    out.push(NamedTensor::learnable(
        format!("{prefix}.weight"),
        ParamTensor::D1(bn.gamma.val()),
    ));
    out.push(NamedTensor::learnable(
        format!("{prefix}.bias"),
        ParamTensor::D1(bn.beta.val()),
    ));
    out.push(NamedTensor::buffer(
        format!("{prefix}.running_mean"),
        ParamTensor::D1(bn.running_mean.value()),
    ));
    out.push(NamedTensor::buffer(
        format!("{prefix}.running_var"),
        ParamTensor::D1(bn.running_var.value()),
    ));
}

/// Backbone and classification head
#[derive(Module, Debug)]
pub struct IncrementalNet<B: Backend> {
    pub convnet: ConvNet<B>,
    pub fc: Linear<B>,
}

impl<B: Backend> IncrementalNet<B> {
    /// Build a network whose head covers `num_classes` classes.
    pub fn new(
        config: &NetConfig,
        num_classes: usize,
        device: &B::Device,
    ) -> cil_core::Result<Self> {
        config.validate()?;
        if num_classes == 0 {
            return Err(Error::Model("the head needs at least one class".to_string()));
        }
        let (convnet, feature_dim) = match (config.backbone, config.input) {
            (BackboneKind::Mlp, input) => (
                ConvNet::Mlp(MlpBackbone::new(input.numel(), config, device)),
                config.feature_dim,
            ),
            (
                BackboneKind::Cnn,
                InputShape::Image {
                    channels,
                    height,
                    width,
                },
            ) => (
                ConvNet::Cnn(CnnBackbone::new(
                    channels,
                    height,
                    width,
                    config.base_channels,
                    device,
                )),
                config.base_channels * 2,
            ),
            (BackboneKind::Cnn, InputShape::Flat(_)) => {
                return Err(Error::Config("the cnn backbone needs image inputs".to_string()))
            }
        };
        Ok(Self {
            convnet,
            fc: LinearConfig::new(feature_dim, num_classes).init(device),
        })
    }

    pub fn feature_dim(&self) -> usize {
        self.fc.weight.dims()[0]
    }

    /// Output dimensionality of the head.
    pub fn num_classes(&self) -> usize {
        self.fc.weight.dims()[1]
    }

    pub fn extract_vector(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.convnet.forward(x)
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(self.extract_vector(x))
    }

    /// Logits with the backbone cut out of the autodiff graph.
    pub fn forward_head_only(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(self.extract_vector(x).detach())
    }

    /// Grow the head to `total` outputs. Existing columns are kept as they
    /// are; only the new ones are freshly initialised.
    pub fn update_fc(self, total: usize, device: &B::Device) -> Self {
        let known = self.num_classes();
        if total <= known {
            return self;
        }
        let features = self.feature_dim();
        let fresh: Linear<B> = LinearConfig::new(features, total).init(device);

        // Parameters must be leaf tensors.
        let weight = Tensor::cat(
            vec![
                self.fc.weight.val(),
                fresh.weight.val().slice([0..features, known..total]),
            ],
            1,
        );
        let weight = Tensor::<B, 2>::from_data(weight.into_data(), device);
        let bias = match (&self.fc.bias, &fresh.bias) {
            (Some(old), Some(new)) => {
                let bias = Tensor::cat(vec![old.val(), new.val().slice([known..total])], 0);
                Some(Param::from_tensor(Tensor::<B, 1>::from_data(
                    bias.into_data(),
                    device,
                )))
            }
            _ => None,
        };

        Self {
            convnet: self.convnet,
            fc: Linear {
                weight: Param::from_tensor(weight),
                bias,
            },
        }
    }

    /// Backbone tensors (prefixed `convnet.`) followed by the head (`fc.`).
    pub fn named_tensors(&self) -> Vec<NamedTensor<B>> {
        let mut out = Vec::new();
        match &self.convnet {
            ConvNet::Mlp(mlp) => {
                linear_tensors("convnet.fc1", &mlp.fc1, &mut out);
                linear_tensors("convnet.fc2", &mlp.fc2, &mut out);
            }
            ConvNet::Cnn(cnn) => {
                conv_tensors("convnet.conv1.0", &cnn.conv1.conv, &mut out);
                norm_tensors("convnet.conv1.1", &cnn.conv1.bn, &mut out);
                for (name, block) in [("layer1", &cnn.layer1), ("layer2", &cnn.layer2)] {
                    conv_tensors(&format!("convnet.{name}.conv"), &block.conv, &mut out);
                    norm_tensors(&format!("convnet.{name}.bn"), &block.bn, &mut out);
                }
            }
        }
        linear_tensors("fc", &self.fc, &mut out);
        out
    }

    /// Learnable backbone tensors, in a stable order.
    pub fn backbone_params(&self) -> Vec<ParamTensor<B>> {
        self.named_tensors()
            .into_iter()
            .filter(|t| t.role == TensorRole::Learnable && t.name.starts_with("convnet."))
            .map(|t| t.tensor)
            .collect()
    }

    /// Parameter count, optionally restricted to what the optimizer updates.
    pub fn count_parameters(&self, frozen_backbone: bool) -> usize {
        if frozen_backbone {
            self.fc.num_params()
        } else {
            self.num_params()
        }
    }
}
