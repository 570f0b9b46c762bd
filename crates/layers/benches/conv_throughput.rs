use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{BatchNormConfig, Conv2dConfig, ConvBn, PrecisionPlan};

fn bench_conv_bn(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let shapes = &[(3usize, 64usize, 32usize), (64, 128, 16), (128, 256, 8)];
    let dtypes = &[DType::F32, DType::F16];

    for &dtype in dtypes {
        let plan = PrecisionPlan::new(dtype, device.clone());
        let mut group = c.benchmark_group(format!("conv_bn/{dtype:?}"));
        for &(in_channels, out_channels, side) in shapes {
            let block = ConvBn::new(
                Conv2dConfig::same(in_channels, out_channels),
                BatchNormConfig::new(out_channels),
                &plan,
            )
            .expect("conv_bn init");
            let input = Tensor::randn(0f32, 1.0, (batch, in_channels, side, side), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let macs = (batch * side * side * in_channels * out_channels * 9) as u64;
            group.throughput(Throughput::Elements(macs));
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{in_channels}x{out_channels}@{side}")),
                &(block, input),
                |b, (block, input)| {
                    b.iter(|| {
                        let out = block.forward_t(black_box(input), true).expect("forward");
                        black_box(out);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_conv_bn);
criterion_main!(benches);
