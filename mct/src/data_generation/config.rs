//! Typed configuration of a data generation run.
//!
//! Every strategy is a closed enum. Names are parsed with [`std::str::FromStr`] or through
//! serde; unknown names are rejected while the config is built, before anything runs.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Pixel value range of the generated images before normalization
pub const MAX_PIXEL_VALUE: f32 = 255.0;

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $repr:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const VALUES: &'static [&'static str] = &[$($repr),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, ConfigError> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    _ => Err(ConfigError::InvalidEnumValue {
                        kind: stringify!($name),
                        value: s.to_string(),
                        expected: Self::VALUES,
                    }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer)?
                    .parse()
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

config_enum!(
    SchedulerType {
        Step => "step",
        ReduceOnPlateau => "reduce_on_plateau",
    }
);

config_enum!(
    OptimizerType {
        Adam => "adam",
        Sgd => "sgd",
    }
);

config_enum!(
    DataInitType {
        /// Standard normal pixels
        Gaussian => "gaussian",
        /// Normal pixels with a random mean and std per image
        Diverse => "diverse",
    }
);

config_enum!(
    BnLayerWeightingType {
        Average => "average",
        /// Average, with the first batch-norm layer weighted ten times more
        FirstLayerMultiplier => "first_layer_multiplier",
    }
);

config_enum!(
    BatchNormAlignmentLossType {
        L2Square => "l2_square",
    }
);

config_enum!(
    /// Over which images the statistics compared to the batch-norm ones are computed
    ImageGranularity {
        ImageWise => "image_wise",
        BatchWise => "batch_wise",
        AllImages => "all_images",
    }
);

config_enum!(
    ImagePipelineType {
        Identity => "identity",
        RandomCrop => "random_crop",
        RandomCropFlip => "random_crop_flip",
    }
);

config_enum!(
    OutputLossType {
        None => "none",
        MinMaxDiff => "min_max_diff",
        RegularizedMinMaxDiff => "regularized_min_max_diff",
    }
);

/// Per channel normalization the model expects its input images in
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageNormalizationType {
    Torchvision,
    KerasApplications,
    NoNormalization,
    Custom { mean: Vec<f32>, std: Vec<f32> },
}

impl ImageNormalizationType {
    pub const VALUES: &'static [&'static str] =
        &["torchvision", "keras_applications", "no_normalization"];

    /// `(mean, std)` per channel, in pixel units
    pub fn mean_std(&self) -> (Vec<f32>, Vec<f32>) {
        match self {
            Self::Torchvision => (
                [0.485, 0.456, 0.406].iter().map(|v| v * MAX_PIXEL_VALUE).collect(),
                [0.229, 0.224, 0.225].iter().map(|v| v * MAX_PIXEL_VALUE).collect(),
            ),
            Self::KerasApplications => (vec![127.5; 3], vec![127.5; 3]),
            Self::NoNormalization => (vec![0.0; 3], vec![1.0; 3]),
            Self::Custom { mean, std } => (mean.clone(), std.clone()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (mean, std) = self.mean_std();
        if mean.len() != std.len() {
            return Err(ConfigError::NormalizationLengthMismatch {
                mean: mean.len(),
                std: std.len(),
            });
        }
        if let Some(channel) = std.iter().position(|s| *s == 0.0) {
            return Err(ConfigError::ZeroNormalizationStd { channel });
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageNormalizationType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "torchvision" => Ok(Self::Torchvision),
            "keras_applications" => Ok(Self::KerasApplications),
            "no_normalization" => Ok(Self::NoNormalization),
            _ => Err(ConfigError::InvalidEnumValue {
                kind: "ImageNormalizationType",
                value: s.to_string(),
                expected: Self::VALUES,
            }),
        }
    }
}

/// Immutable, validated configuration of a data generation run.
/// Built with [`DataGenerationConfig::builder`] or deserialized, both validating.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DataGenerationConfigBuilder")]
pub struct DataGenerationConfig {
    n_iter: usize,
    optimizer: OptimizerType,
    data_gen_batch_size: usize,
    initial_lr: f32,
    output_loss_multiplier: f32,
    scheduler_type: SchedulerType,
    bn_alignment_loss_type: BatchNormAlignmentLossType,
    output_loss_type: OutputLossType,
    data_init_type: DataInitType,
    layer_weighting_type: BnLayerWeightingType,
    image_granularity: ImageGranularity,
    image_pipeline_type: ImagePipelineType,
    image_normalization_type: ImageNormalizationType,
    extra_pixels: usize,
    clip_images: bool,
    reflection: bool,
    seed: u64,
}

macro_rules! getters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(&self) -> $ty {
                self.$field
            }
        )*
    };
}

impl DataGenerationConfig {
    pub fn builder() -> DataGenerationConfigBuilder {
        DataGenerationConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<DataGenerationConfigBuilder>(json)?.build()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    getters!(
        n_iter: usize,
        optimizer: OptimizerType,
        data_gen_batch_size: usize,
        initial_lr: f32,
        output_loss_multiplier: f32,
        scheduler_type: SchedulerType,
        bn_alignment_loss_type: BatchNormAlignmentLossType,
        output_loss_type: OutputLossType,
        data_init_type: DataInitType,
        layer_weighting_type: BnLayerWeightingType,
        image_granularity: ImageGranularity,
        image_pipeline_type: ImagePipelineType,
        extra_pixels: usize,
        clip_images: bool,
        reflection: bool,
        seed: u64,
    );

    pub fn image_normalization_type(&self) -> &ImageNormalizationType {
        &self.image_normalization_type
    }

    /// Running statistics over every image are only kept when they are the optimization target
    pub fn use_all_data_stats(&self) -> bool {
        self.image_granularity == ImageGranularity::AllImages
    }

    /// Valid range of each channel once normalized
    pub fn clip_bounds(&self) -> Vec<(f32, f32)> {
        let (mean, std) = self.image_normalization_type.mean_std();
        mean.iter()
            .zip(&std)
            .map(|(m, s)| ((0.0 - m) / s, (MAX_PIXEL_VALUE - m) / s))
            .collect()
    }
}

/// Unvalidated [`DataGenerationConfig`]. Every field has a default, which missing JSON
/// fields take too.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataGenerationConfigBuilder {
    pub n_iter: usize,
    pub optimizer: OptimizerType,
    pub data_gen_batch_size: usize,
    pub initial_lr: f32,
    pub output_loss_multiplier: f32,
    pub scheduler_type: SchedulerType,
    pub bn_alignment_loss_type: BatchNormAlignmentLossType,
    pub output_loss_type: OutputLossType,
    pub data_init_type: DataInitType,
    pub layer_weighting_type: BnLayerWeightingType,
    pub image_granularity: ImageGranularity,
    pub image_pipeline_type: ImagePipelineType,
    pub image_normalization_type: ImageNormalizationType,
    pub extra_pixels: usize,
    pub clip_images: bool,
    pub reflection: bool,
    pub seed: u64,
}

impl Default for DataGenerationConfigBuilder {
    fn default() -> Self {
        Self {
            n_iter: 500,
            optimizer: OptimizerType::Adam,
            data_gen_batch_size: 32,
            initial_lr: 16.0,
            output_loss_multiplier: 1e-4,
            scheduler_type: SchedulerType::ReduceOnPlateau,
            bn_alignment_loss_type: BatchNormAlignmentLossType::L2Square,
            output_loss_type: OutputLossType::RegularizedMinMaxDiff,
            data_init_type: DataInitType::Gaussian,
            layer_weighting_type: BnLayerWeightingType::Average,
            image_granularity: ImageGranularity::AllImages,
            image_pipeline_type: ImagePipelineType::RandomCropFlip,
            image_normalization_type: ImageNormalizationType::Torchvision,
            extra_pixels: 0,
            clip_images: true,
            reflection: true,
            seed: 0,
        }
    }
}

macro_rules! setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(mut self, $field: $ty) -> Self {
                self.$field = $field;
                self
            }
        )*
    };
}

impl DataGenerationConfigBuilder {
    setters!(
        n_iter: usize,
        optimizer: OptimizerType,
        data_gen_batch_size: usize,
        initial_lr: f32,
        output_loss_multiplier: f32,
        scheduler_type: SchedulerType,
        bn_alignment_loss_type: BatchNormAlignmentLossType,
        output_loss_type: OutputLossType,
        data_init_type: DataInitType,
        layer_weighting_type: BnLayerWeightingType,
        image_granularity: ImageGranularity,
        image_pipeline_type: ImagePipelineType,
        image_normalization_type: ImageNormalizationType,
        extra_pixels: usize,
        clip_images: bool,
        reflection: bool,
        seed: u64,
    );

    pub fn build(self) -> Result<DataGenerationConfig, ConfigError> {
        let invalid = |name, reason: &str| ConfigError::InvalidParameter {
            name,
            reason: reason.to_string(),
        };
        if self.n_iter == 0 {
            return Err(invalid("n_iter", "must be positive"));
        }
        if self.data_gen_batch_size == 0 {
            return Err(invalid("data_gen_batch_size", "must be positive"));
        }
        if !(self.initial_lr > 0.0 && self.initial_lr.is_finite()) {
            return Err(invalid("initial_lr", "must be a positive number"));
        }
        if !(self.output_loss_multiplier >= 0.0 && self.output_loss_multiplier.is_finite()) {
            return Err(invalid("output_loss_multiplier", "must be a non negative number"));
        }
        self.image_normalization_type.validate()?;
        Ok(DataGenerationConfig {
            n_iter: self.n_iter,
            optimizer: self.optimizer,
            data_gen_batch_size: self.data_gen_batch_size,
            initial_lr: self.initial_lr,
            output_loss_multiplier: self.output_loss_multiplier,
            scheduler_type: self.scheduler_type,
            bn_alignment_loss_type: self.bn_alignment_loss_type,
            output_loss_type: self.output_loss_type,
            data_init_type: self.data_init_type,
            layer_weighting_type: self.layer_weighting_type,
            image_granularity: self.image_granularity,
            image_pipeline_type: self.image_pipeline_type,
            image_normalization_type: self.image_normalization_type,
            extra_pixels: self.extra_pixels,
            clip_images: self.clip_images,
            reflection: self.reflection,
            seed: self.seed,
        })
    }
}

impl TryFrom<DataGenerationConfigBuilder> for DataGenerationConfig {
    type Error = ConfigError;

    fn try_from(builder: DataGenerationConfigBuilder) -> Result<Self, ConfigError> {
        builder.build()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = DataGenerationConfig::builder().build().unwrap();
        assert_eq!(config.n_iter(), 500);
        assert_eq!(config.data_gen_batch_size(), 32);
        assert_eq!(config.initial_lr(), 16.0);
        assert_eq!(config.scheduler_type(), SchedulerType::ReduceOnPlateau);
        assert_eq!(config.image_pipeline_type(), ImagePipelineType::RandomCropFlip);
        assert!(config.use_all_data_stats());
        assert!(config.clip_images() && config.reflection());
    }

    #[test]
    fn test_zero_std_is_rejected() {
        let err = DataGenerationConfig::builder()
            .image_normalization_type(ImageNormalizationType::Custom {
                mean: vec![0.0, 0.0, 0.0],
                std: vec![1.0, 0.0, 1.0],
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroNormalizationStd { channel: 1 }));

        let err = DataGenerationConfig::builder()
            .image_normalization_type(ImageNormalizationType::Custom {
                mean: vec![0.0; 3],
                std: vec![1.0; 2],
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NormalizationLengthMismatch { mean: 3, std: 2 }));
    }

    #[rstest]
    #[case(DataGenerationConfig::builder().n_iter(0), "n_iter")]
    #[case(DataGenerationConfig::builder().data_gen_batch_size(0), "data_gen_batch_size")]
    #[case(DataGenerationConfig::builder().initial_lr(0.0), "initial_lr")]
    #[case(DataGenerationConfig::builder().output_loss_multiplier(-1.0), "output_loss_multiplier")]
    fn test_invalid_parameters(#[case] builder: DataGenerationConfigBuilder, #[case] field: &str) {
        assert!(matches!(
            builder.build(),
            Err(ConfigError::InvalidParameter { name, .. }) if name == field
        ));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(
            "reduce_on_plateau".parse::<SchedulerType>().unwrap(),
            SchedulerType::ReduceOnPlateau
        );
        assert_eq!(ImageGranularity::BatchWise.to_string(), "batch_wise");
        let err = "cosine".parse::<SchedulerType>().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnumValue { kind: "SchedulerType", ref value, .. } if value == "cosine"
        ));
        assert!("custom".parse::<ImageNormalizationType>().is_err());
    }

    #[test]
    fn test_json_config_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "n_iter": 2,
                "data_gen_batch_size": 4,
                "scheduler_type": "step",
                "image_granularity": "batch_wise",
                "image_normalization_type": {{"custom": {{"mean": [0.0], "std": [1.0]}}}}
            }}"#
        )?;
        let config = DataGenerationConfig::from_json_file(file.path())?;
        assert_eq!(config.n_iter(), 2);
        assert_eq!(config.scheduler_type(), SchedulerType::Step);
        assert_eq!(config.optimizer(), OptimizerType::Adam);
        assert_eq!(config.clip_bounds(), vec![(0.0, 255.0)]);

        // serde goes through the same validation
        let zero_std = r#"{"image_normalization_type": {"custom": {"mean": [0.0], "std": [0.0]}}}"#;
        assert!(matches!(
            DataGenerationConfig::from_json_str(zero_std),
            Err(ConfigError::ZeroNormalizationStd { channel: 0 })
        ));
        assert!(serde_json::from_str::<DataGenerationConfig>(zero_std).is_err());
        assert!(matches!(
            DataGenerationConfig::from_json_str(r#"{"scheduler_type": "cosine"}"#),
            Err(ConfigError::Parse(_))
        ));

        let round_trip: DataGenerationConfig = serde_json::from_str(&serde_json::to_string(&config)?)?;
        assert_eq!(round_trip, config);
        Ok(())
    }
}
