//! 計算バックエンドの選択

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};

use crate::model::config::DeviceType;

/// CPU (NdArray) バックエンド
pub type CpuBackend = NdArray<f32>;

/// GPU (WGPU) バックエンド
pub type GpuBackend = Wgpu;

/// 学習用（自動微分付き）
pub type CpuTrainBackend = Autodiff<CpuBackend>;
pub type GpuTrainBackend = Autodiff<GpuBackend>;

/// CPUデバイス
pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// GPUデバイス（WGPUが選ぶ既定のアダプタ）
pub fn gpu_device() -> WgpuDevice {
    WgpuDevice::DefaultDevice
}

/// `DeviceType` に応じたバックエンドで処理を実行する
///
/// ```ignore
/// with_backend!(config.device_type, |B, device| train_model::<B>(&config, device))
/// ```
#[macro_export]
macro_rules! with_backend {
    ($device_type:expr, |$backend:ident, $device:ident| $body:expr) => {
        match $device_type {
            $crate::model::config::DeviceType::Cpu => {
                type $backend = $crate::ml::backend::CpuTrainBackend;
                let $device = $crate::ml::backend::cpu_device();
                $body
            }
            $crate::model::config::DeviceType::Wgpu => {
                type $backend = $crate::ml::backend::GpuTrainBackend;
                let $device = $crate::ml::backend::gpu_device();
                $body
            }
        }
    };
}

/// ログ表示用のデバイス名
pub fn describe(device_type: DeviceType) -> String {
    match device_type {
        DeviceType::Cpu => format!("{} ({:?})", device_type, cpu_device()),
        DeviceType::Wgpu => format!("{} ({:?})", device_type, gpu_device()),
    }
}
