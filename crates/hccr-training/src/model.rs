//! EfficientNetV2 for handwritten character classification.
//!
//! Early stages use Fused-MBConv blocks (a single full 3x3 convolution in
//! place of expand + depthwise), later stages use MBConv blocks with
//! squeeze-and-excitation. All convolutions are followed by batch norm and,
//! except for projections, SiLU.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};
use hccr_core::ModelVariant;

/// Any network mapping `[N, 3, H, W]` images to `[N, num_classes]` logits.
pub trait ImageClassifier<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_classes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Fused,
    MbConv,
}

/// One row of the stage table.
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub kind: BlockKind,
    pub expand_ratio: usize,
    pub stride: usize,
    pub channels: usize,
    pub layers: usize,
    /// Squeeze-and-excitation ratio relative to the block input, 0 disables it
    pub se_ratio: f64,
}

const fn stage(
    kind: BlockKind,
    expand_ratio: usize,
    stride: usize,
    channels: usize,
    layers: usize,
    se_ratio: f64,
) -> StageSpec {
    StageSpec {
        kind,
        expand_ratio,
        stride,
        channels,
        layers,
        se_ratio,
    }
}

/// Stem width, stages and head width for a variant.
pub fn stage_table(variant: ModelVariant) -> (usize, Vec<StageSpec>, usize) {
    use BlockKind::*;
    match variant {
        ModelVariant::Small => (
            24,
            vec![
                stage(Fused, 1, 1, 24, 2, 0.0),
                stage(Fused, 4, 2, 48, 4, 0.0),
                stage(Fused, 4, 2, 64, 4, 0.0),
                stage(MbConv, 4, 2, 128, 6, 0.25),
                stage(MbConv, 6, 1, 160, 9, 0.25),
                stage(MbConv, 6, 2, 256, 15, 0.25),
            ],
            1280,
        ),
        ModelVariant::Tiny => (
            8,
            vec![
                stage(Fused, 1, 1, 8, 1, 0.0),
                stage(MbConv, 2, 2, 16, 1, 0.25),
            ],
            32,
        ),
    }
}

/// Configuration for [`EfficientNetV2`]
#[derive(Config, Debug)]
pub struct EfficientNetV2Config {
    pub num_classes: usize,
    pub variant: ModelVariant,
    #[config(default = "0.2")]
    pub dropout: f64,
}

impl EfficientNetV2Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetV2<B> {
        let (stem_channels, stages, head_channels) = stage_table(self.variant);

        let stem = ConvBnAct::new(3, stem_channels, 3, 2, 1, true, device);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for spec in &stages {
            for layer in 0..spec.layers {
                let stride = if layer == 0 { spec.stride } else { 1 };
                let block = match spec.kind {
                    BlockKind::Fused => Block::Fused(FusedMbConv::new(
                        in_channels,
                        spec.channels,
                        spec.expand_ratio,
                        stride,
                        device,
                    )),
                    BlockKind::MbConv => Block::MbConv(MbConv::new(
                        in_channels,
                        spec.channels,
                        spec.expand_ratio,
                        stride,
                        spec.se_ratio,
                        device,
                    )),
                };
                blocks.push(block);
                in_channels = spec.channels;
            }
        }

        let head = ConvBnAct::new(in_channels, head_channels, 1, 1, 0, true, device);

        EfficientNetV2 {
            stem,
            blocks,
            head,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(head_channels, self.num_classes).init(device),
            num_classes: self.num_classes,
        }
    }
}

/// Convolution, batch norm and optional SiLU
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    activate: bool,
}

impl<B: Backend> ConvBnAct<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        activate: bool,
        device: &B::Device,
    ) -> Self {
        Self::grouped(in_channels, out_channels, kernel, stride, padding, 1, activate, device)
    }

    #[allow(clippy::too_many_arguments)]
    fn grouped(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        groups: usize,
        activate: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            activate,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn.forward(self.conv.forward(x));
        if self.activate {
            silu(x)
        } else {
            x
        }
    }
}

/// Channel attention: global pool, bottleneck, sigmoid gate.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

#[derive(Module, Debug)]
pub struct FusedMbConv<B: Backend> {
    expand: ConvBnAct<B>,
    project: Option<ConvBnAct<B>>,
    residual: bool,
}

impl<B: Backend> FusedMbConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let residual = stride == 1 && in_channels == out_channels;

        if expand_ratio == 1 {
            return Self {
                expand: ConvBnAct::new(in_channels, out_channels, 3, stride, 1, true, device),
                project: None,
                residual,
            };
        }

        let hidden = in_channels * expand_ratio;
        Self {
            expand: ConvBnAct::new(in_channels, hidden, 3, stride, 1, true, device),
            project: Some(ConvBnAct::new(hidden, out_channels, 1, 1, 0, false, device)),
            residual,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.expand.forward(input.clone());
        let x = match &self.project {
            Some(project) => project.forward(x),
            None => x,
        };
        if self.residual {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvBnAct<B>>,
    depthwise: ConvBnAct<B>,
    se: Option<SqueezeExcite<B>>,
    project: ConvBnAct<B>,
    residual: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        stride: usize,
        se_ratio: f64,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| ConvBnAct::new(in_channels, hidden, 1, 1, 0, true, device));
        let depthwise = ConvBnAct::grouped(hidden, hidden, 3, stride, 1, hidden, true, device);
        let se = (se_ratio > 0.0).then(|| {
            let squeezed = ((in_channels as f64 * se_ratio) as usize).max(1);
            SqueezeExcite::new(hidden, squeezed, device)
        });

        Self {
            expand,
            depthwise,
            se,
            project: ConvBnAct::new(hidden, out_channels, 1, 1, 0, false, device),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = match &self.se {
            Some(se) => se.forward(x),
            None => x,
        };
        let x = self.project.forward(x);
        if self.residual {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub enum Block<B: Backend> {
    Fused(FusedMbConv<B>),
    MbConv(MbConv<B>),
}

impl<B: Backend> Block<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Block::Fused(block) => block.forward(x),
            Block::MbConv(block) => block.forward(x),
        }
    }
}

/// EfficientNetV2 classifier
///
/// - Stem: Conv 3x3, stride 2
/// - Fused-MBConv and MBConv stages from [`stage_table`]
/// - Head: Conv 1x1, global average pool, dropout, linear
#[derive(Module, Debug)]
pub struct EfficientNetV2<B: Backend> {
    stem: ConvBnAct<B>,
    blocks: Vec<Block<B>>,
    head: ConvBnAct<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    classifier: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> EfficientNetV2<B> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl<B: Backend> ImageClassifier<B> for EfficientNetV2<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.head.forward(x);
        let x = self.pool.forward(x);
        let x = x.flatten::<2>(1, 3);
        let x = self.dropout.forward(x);
        self.classifier.forward(x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
