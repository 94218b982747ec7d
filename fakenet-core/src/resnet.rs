use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Output channels of a bottleneck are `width * EXPANSION`.
pub const EXPANSION: usize = 4;

/// One row of the stage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub blocks: usize,
    /// Bottleneck width as a multiple of the base width
    pub width: usize,
    /// Stride of the first block, the others use 1
    pub stride: usize,
}

const fn stage(blocks: usize, width: usize, stride: usize) -> StageSpec {
    StageSpec {
        blocks,
        width,
        stride,
    }
}

pub const RESNET50: [StageSpec; 4] = [
    stage(3, 1, 1),
    stage(4, 2, 2),
    stage(6, 4, 2),
    stage(3, 8, 2),
];
pub const RESNET101: [StageSpec; 4] = [
    stage(3, 1, 1),
    stage(4, 2, 2),
    stage(23, 4, 2),
    stage(3, 8, 2),
];
pub const RESNET152: [StageSpec; 4] = [
    stage(3, 1, 1),
    stage(8, 2, 2),
    stage(36, 4, 2),
    stage(3, 8, 2),
];

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(kernel / 2, kernel / 2))
        .with_bias(false)
        .init(device)
}

/// 1x1 strided convolution matching the residual branch's output shape.
#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> Projection<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    norm3: BatchNorm<B, 2>,
    relu: Relu,
    projection: Option<Projection<B>>,
}

impl<B: Backend> Bottleneck<B> {
    /// # Shapes
    ///   - Input [batch_size, in_channels, height, width]
    ///   - Output [batch_size, width * 4, height / stride, width / stride]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.projection {
            Some(projection) => projection.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.norm1.forward(self.conv1.forward(x)));
        let out = self.relu.forward(self.norm2.forward(self.conv2.forward(out)));
        let out = self.norm3.forward(self.conv3.forward(out));

        self.relu.forward(out + shortcut)
    }

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }
}

#[derive(Config, Debug)]
pub struct BottleneckConfig {
    in_channels: usize,
    width: usize,
    #[config(default = 1)]
    stride: usize,
}

impl BottleneckConfig {
    pub fn out_channels(&self) -> usize {
        self.width * EXPANSION
    }

    /// The identity shortcut only fits when neither channels nor resolution change.
    pub fn needs_projection(&self) -> bool {
        self.stride != 1 || self.in_channels != self.out_channels()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Bottleneck<B> {
        let out_channels = self.out_channels();
        let projection = self.needs_projection().then(|| Projection {
            conv: conv([self.in_channels, out_channels], 1, self.stride, device),
            norm: BatchNormConfig::new(out_channels).init(device),
        });
        Bottleneck {
            conv1: conv([self.in_channels, self.width], 1, 1, device),
            norm1: BatchNormConfig::new(self.width).init(device),
            conv2: conv([self.width, self.width], 3, self.stride, device),
            norm2: BatchNormConfig::new(self.width).init(device),
            conv3: conv([self.width, out_channels], 1, 1, device),
            norm3: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            projection,
        }
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> Stage<B> {
    /// Only the first block changes stride and channel count.
    fn new(entry: StageSpec, in_channels: usize, width: usize, device: &B::Device) -> Self {
        let first = BottleneckConfig::new(in_channels, width).with_stride(entry.stride);
        let out_channels = first.out_channels();
        let blocks = std::iter::once(first.init(device))
            .chain(
                (1..entry.blocks).map(|_| BottleneckConfig::new(out_channels, width).init(device)),
            )
            .collect();
        Self { blocks }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn blocks(&self) -> &[Bottleneck<B>] {
        &self.blocks
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    stages: Vec<Stage<B>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(
        table: &[StageSpec],
        base_width: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let mut in_channels = base_width;
        let mut stages = Vec::with_capacity(table.len());
        for entry in table {
            let width = base_width * entry.width;
            stages.push(Stage::new(*entry, in_channels, width, device));
            in_channels = width * EXPANSION;
        }

        Self {
            conv1: conv([3, base_width], 7, 2, device),
            norm1: BatchNormConfig::new(base_width).init(device),
            relu: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stages,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, num_classes).init(device),
        }
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.norm1.forward(self.conv1.forward(x)));
        let x = self.maxpool.forward(x);
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = self.avgpool.forward(x); // [batch_size, channels, 1, 1]
        let x = x.flatten::<2>(1, 3);
        self.fc.forward(x)
    }

    pub fn stages(&self) -> &[Stage<B>] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_bottleneck_shapes() {
        let device = Default::default();
        // (in_channels, width, stride, projection)
        for (in_channels, width, stride, projection) in
            [(16, 4, 1, false), (8, 4, 1, true), (16, 8, 2, true), (8, 2, 2, true)]
        {
            let config = BottleneckConfig::new(in_channels, width).with_stride(stride);
            assert_eq!(config.needs_projection(), projection);
            let block = config.init::<TestBackend>(&device);
            assert_eq!(block.has_projection(), projection);

            let x = Tensor::<TestBackend, 4>::random(
                [2, in_channels, 12, 12],
                burn::tensor::Distribution::Default,
                &device,
            );
            assert_eq!(
                block.forward(x).dims(),
                [2, width * EXPANSION, 12 / stride, 12 / stride]
            );
        }
    }

    #[test]
    fn test_only_first_block_of_a_stage_projects() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::new(&RESNET50, 4, 2, &device);
        let counts = model
            .stages()
            .iter()
            .map(|stage| stage.blocks().len())
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![3, 4, 6, 3]);
        for stage in model.stages() {
            assert!(stage.blocks()[0].has_projection());
            assert!(stage.blocks()[1..].iter().all(|b| !b.has_projection()));
        }
    }

    #[test]
    fn test_resnet_logits_shape() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::new(&RESNET50, 4, 2, &device);
        let x = Tensor::<TestBackend, 4>::zeros([3, 3, 32, 32], &device);
        assert_eq!(model.forward(x).dims(), [3, 2]);
    }

    #[test]
    fn test_resnet50_parameter_count() {
        let device = Default::default();
        let model = ResNet::<TestBackend>::new(&RESNET50, 64, 2, &device);
        // 23_512_130 trainable, plus running mean and variance of 26_560 BN channels
        assert_eq!(model.num_params(), 23_565_250);
    }

    #[test]
    fn test_deeper_tables() {
        assert_eq!(RESNET101.iter().map(|s| s.blocks).sum::<usize>(), 33);
        assert_eq!(RESNET152.iter().map(|s| s.blocks).sum::<usize>(), 50);
        // three convolutions per block, plus the stem and the classifier
        assert_eq!(RESNET50.iter().map(|s| s.blocks).sum::<usize>() * 3 + 2, 50);
    }
}
