use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{Classifier, ConvNet, ModelConfig};

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = ConvNet::new(ModelConfig::tiny(10, Device::Cpu))?;
    let images = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?;

    let logits = model.forward_t(&images, true)?;

    assert_eq!(logits.dims(), &[2, 10]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn eval_mode_is_deterministic() -> Result<()> {
    let model = ConvNet::new(ModelConfig::tiny(4, Device::Cpu))?;
    let images = Tensor::randn(0f32, 1.0, (3, 3, 32, 32), &Device::Cpu)?;

    let first = model.forward_t(&images, false)?.to_vec2::<f32>()?;
    let second = model.forward_t(&images, false)?.to_vec2::<f32>()?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn trainable_parameters_skip_running_statistics() -> Result<()> {
    let model = ConvNet::new(ModelConfig::tiny(10, Device::Cpu))?;
    let params = model.trainable_parameters();

    // 8 conv-bn blocks with conv weight + bn weight + bn bias, plus the head weight
    assert_eq!(params.len(), 8 * 3 + 1);
    assert!(params.iter().all(|(name, _)| !name.contains("running")));
    assert_eq!(params.last().map(|(name, _)| name.as_str()), Some("head.weight"));
    assert_eq!(model.buffers().len(), 8 * 2);
    Ok(())
}

#[test]
fn reference_config_keeps_batch_norm_in_f32() -> Result<()> {
    let model = ConvNet::new(ModelConfig::cifar10(DType::F16, Device::Cpu))?;
    for (name, var) in model.trainable_parameters() {
        if name.contains(".bn.") {
            assert_eq!(var.dtype(), DType::F32, "{name}");
        } else {
            assert_eq!(var.dtype(), DType::F16, "{name}");
        }
    }
    assert_eq!(model.input_dtype(), DType::F16);
    Ok(())
}

#[test]
fn invalid_widths_are_rejected() {
    let mut config = ModelConfig::tiny(10, Device::Cpu);
    config.stage1_channels = 7;
    assert!(ConvNet::new(config).is_err());

    let mut config = ModelConfig::tiny(10, Device::Cpu);
    config.num_classes = 0;
    assert!(ConvNet::new(config).is_err());
}
