use crate::resnet::{ResNet, StageSpec, RESNET101, RESNET152, RESNET50};
use burn::prelude::*;
use burn::train::ClassificationOutput;
use clap::builder::OsStr;
use clap::ValueEnum;
use nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use serde::{Deserialize, Serialize};

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    resnet: ResNet<B>,
    loss: CrossEntropyLoss<B>,
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, 224, 224]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.resnet.forward(images)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = self.loss.forward(output.clone(), targets.clone());
        ClassificationOutput::new(loss, output, targets)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "ResNetType::Layer50")]
    pub resnet: ResNetType,
    #[config(default = 2)]
    pub num_classes: usize,
    /// Channels of the stem, the stages use 1x, 2x, 4x and 8x of it
    #[config(default = 64)]
    pub base_width: usize,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            resnet: ResNet::new(
                &self.resnet.stages(),
                self.base_width,
                self.num_classes,
                device,
            ),
            loss: CrossEntropyLossConfig::new().init(device),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ResNetType {
    #[default]
    Layer50 = 50,
    Layer101 = 101,
    Layer152 = 152,
}

impl ResNetType {
    pub fn stages(self) -> [StageSpec; 4] {
        match self {
            ResNetType::Layer50 => RESNET50,
            ResNetType::Layer101 => RESNET101,
            ResNetType::Layer152 => RESNET152,
        }
    }
}

impl From<ResNetType> for OsStr {
    fn from(value: ResNetType) -> Self {
        format!("layer{:?}", value as usize).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn test_forward_is_deterministic() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_base_width(4)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([4, 3, 32, 32], Distribution::Default, &device);

        let first = model.forward(images.clone()).into_data();
        let second = model.forward(images).into_data();
        first.assert_eq(&second, true);
    }

    #[test]
    fn test_classification_output() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_base_width(4)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([3, 3, 32, 32], Distribution::Default, &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data([0, 1, 1], &device);

        let output = model.forward_classification(images, targets);
        assert_eq!(output.output.dims(), [3, 2]);
        let loss = output.loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.);
    }

    #[test]
    fn test_resnet_type_names() {
        assert_eq!(OsStr::from(ResNetType::Layer50), OsStr::from("layer50"));
        assert_eq!(ResNetType::Layer152.stages()[2].blocks, 36);
    }
}
