//! 硬件能力检测
//!
//! 本机与远程工作节点共用同一套解析逻辑：`/proc/meminfo`、`nproc`、
//! `uname -m` 的输出，以及 GPU 工具是否存在。

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::translation::error::{TranslationError, TranslationResult};

pub const GB: u64 = 1024 * 1024 * 1024;

/// 每个并发任务预留的内存
const RAM_PER_JOB: u64 = 4 * GB;

/// 按优先顺序检查的 GPU 工具及对应的加速类型
pub const GPU_TOOLS: &[(&str, &str)] = &[
    ("nvidia-smi", "cuda"),
    ("rocm-smi", "rocm"),
    ("vulkaninfo", "vulkan"),
];

/// 主机硬件能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub arch: String,
    pub cpu_cores: usize,
    pub total_ram: u64,
    pub available_ram: u64,
    pub has_gpu: bool,
    pub gpu_type: Option<String>,
    /// 可运行的最大模型参数量
    pub max_model_size: u64,
    pub max_concurrent: usize,
}

impl HardwareCapabilities {
    /// 由探测结果构造，派生字段在这里统一计算
    pub fn from_probe(
        arch: impl Into<String>,
        cpu_cores: usize,
        total_ram: u64,
        available_ram: u64,
        gpu_type: Option<String>,
    ) -> Self {
        let available_ram = available_ram.min(total_ram);
        let has_gpu = gpu_type.is_some();
        Self {
            arch: arch.into(),
            cpu_cores: cpu_cores.max(1),
            total_ram,
            available_ram,
            has_gpu,
            gpu_type,
            max_model_size: max_model_size(available_ram, has_gpu),
            max_concurrent: max_concurrent(cpu_cores, available_ram),
        }
    }

    /// 模型最小内存需求是否满足
    pub fn fits(&self, min_ram: u64) -> bool {
        min_ram <= self.available_ram
    }

    pub fn can_run_model(&self, parameters: u64) -> bool {
        parameters <= self.max_model_size
    }
}

impl fmt::Display for HardwareCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} 核 / 内存 {:.1}/{:.1} GB / GPU {} / 最大模型 {}B",
            self.arch,
            self.cpu_cores,
            self.available_ram as f64 / GB as f64,
            self.total_ram as f64 / GB as f64,
            self.gpu_type.as_deref().unwrap_or("无"),
            self.max_model_size / 1_000_000_000
        )
    }
}

/// 解析 `/proc/meminfo`，返回 (MemTotal, MemAvailable)，单位字节
pub fn parse_meminfo(text: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let field = parts.next();
        let kb = parts.next().and_then(|v| v.parse::<u64>().ok());
        match field {
            Some("MemTotal:") => total = kb.map(|v| v * 1024),
            Some("MemAvailable:") => available = kb.map(|v| v * 1024),
            _ => {}
        }
    }
    (total, available)
}

/// 按可用内存估算可运行的最大模型（参数量，取整到常见档位）
///
/// 推理约需参数量（十亿）两倍的 GB 内存，有 GPU 时为 1.5 倍。
pub fn max_model_size(available_ram: u64, has_gpu: bool) -> u64 {
    let ram_gb = available_ram as f64 / GB as f64;
    let divisor = if has_gpu { 1.5 } else { 2.0 };
    let billions = ram_gb / divisor;

    let tier = [70u64, 27, 13, 7, 3]
        .into_iter()
        .find(|tier| billions >= *tier as f64)
        .unwrap_or(1);
    tier * 1_000_000_000
}

/// 并发上限：clamp(核数 / 2, 1, 可用内存 / 4GB)，至少为 1
pub fn max_concurrent(cpu_cores: usize, available_ram: u64) -> usize {
    let by_ram = ((available_ram / RAM_PER_JOB) as usize).max(1);
    (cpu_cores / 2).clamp(1, by_ram)
}

/// 由 `which` 风格的检查结果判断 GPU 类型
pub fn gpu_from_tools<F>(mut has_tool: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    GPU_TOOLS
        .iter()
        .find(|(tool, _)| has_tool(tool))
        .map(|(_, kind)| kind.to_string())
}

fn on_path(tool: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// 检测本机硬件
pub fn detect_local() -> TranslationResult<HardwareCapabilities> {
    detect_from(Path::new("/proc/meminfo"))
}

fn detect_from(meminfo: &Path) -> TranslationResult<HardwareCapabilities> {
    let text = std::fs::read_to_string(meminfo).map_err(|e| {
        TranslationError::InternalError(format!("无法读取 {}: {}", meminfo.display(), e))
    })?;
    let (total, available) = parse_meminfo(&text);
    let total = total.ok_or_else(|| {
        TranslationError::InternalError("meminfo 中缺少 MemTotal".to_string())
    })?;
    // 拿不到 MemAvailable 时按总量的 70% 估算
    let available = available.unwrap_or(total / 10 * 7);

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let gpu = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        Some("metal".to_string())
    } else {
        gpu_from_tools(on_path)
    };

    let caps = HardwareCapabilities::from_probe(std::env::consts::ARCH, cores, total, available, gpu);
    tracing::debug!("本机硬件: {}", caps);
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let (total, available) = parse_meminfo(MEMINFO);
        assert_eq!(total, Some(16_384_000 * 1024));
        assert_eq!(available, Some(8_192_000 * 1024));
        assert_eq!(parse_meminfo("garbage"), (None, None));
    }

    #[test]
    fn test_max_model_size_tiers() {
        assert_eq!(max_model_size(16 * GB, false), 7_000_000_000);
        assert_eq!(max_model_size(16 * GB, true), 7_000_000_000);
        assert_eq!(max_model_size(24 * GB, true), 13_000_000_000);
        assert_eq!(max_model_size(GB, false), 1_000_000_000);
        assert_eq!(max_model_size(200 * GB, false), 70_000_000_000);
    }

    #[test]
    fn test_max_concurrent_bounds() {
        assert_eq!(max_concurrent(8, 64 * GB), 4);
        assert_eq!(max_concurrent(16, 8 * GB), 2);
        assert_eq!(max_concurrent(1, 64 * GB), 1);
        assert_eq!(max_concurrent(8, GB), 1);
    }

    #[test]
    fn test_available_clamped_to_total() {
        let caps = HardwareCapabilities::from_probe("x86_64", 4, 8 * GB, 16 * GB, None);
        assert_eq!(caps.available_ram, caps.total_ram);
        assert!(caps.fits(6 * GB));
        assert!(!caps.fits(9 * GB));
        assert!(!caps.has_gpu);
    }

    #[test]
    fn test_gpu_detection_order() {
        assert_eq!(gpu_from_tools(|t| t == "vulkaninfo" || t == "rocm-smi"), Some("rocm".into()));
        assert_eq!(gpu_from_tools(|_| false), None);
    }

    #[test]
    fn test_detect_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        std::fs::write(&path, "MemTotal:       4096000 kB\n").unwrap();
        let caps = detect_from(&path).unwrap();
        assert_eq!(caps.total_ram, 4_096_000 * 1024);
        assert_eq!(caps.available_ram, 4_096_000 * 1024 / 10 * 7);
    }
}
