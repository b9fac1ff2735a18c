//! 远程硬件探测
//!
//! 一条远程命令依次输出 meminfo、核数、架构和已安装的 GPU 工具，
//! 各段之间用标记行分隔，解析规则与本机检测共用。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::ssh::{SshEndpoint, SshTransport};
use crate::hardware::{self, HardwareCapabilities, GPU_TOOLS};
use crate::translation::error::{TranslationError, TranslationResult};

const MARK_NPROC: &str = "__NPROC__";
const MARK_ARCH: &str = "__ARCH__";
const MARK_GPU: &str = "__GPU__";

/// 远程探测脚本
pub fn probe_script() -> String {
    let tools: Vec<&str> = GPU_TOOLS.iter().map(|(tool, _)| *tool).collect();
    format!(
        "cat /proc/meminfo; echo {nproc}; nproc; echo {arch}; uname -m; echo {gpu}; \
         for t in {tools}; do command -v $t >/dev/null 2>&1 && echo $t; done; true",
        nproc = MARK_NPROC,
        arch = MARK_ARCH,
        gpu = MARK_GPU,
        tools = tools.join(" ")
    )
}

/// 解析探测输出
pub fn parse_probe_output(output: &str) -> TranslationResult<HardwareCapabilities> {
    let mut meminfo = String::new();
    let mut nproc = String::new();
    let mut arch = String::new();
    let mut gpu_tools: Vec<String> = Vec::new();

    let mut section = 0;
    for line in output.lines() {
        match line.trim() {
            MARK_NPROC => section = 1,
            MARK_ARCH => section = 2,
            MARK_GPU => section = 3,
            value => match section {
                0 => {
                    meminfo.push_str(line);
                    meminfo.push('\n');
                }
                1 if nproc.is_empty() => nproc = value.to_string(),
                2 if arch.is_empty() => arch = value.to_string(),
                3 if !value.is_empty() => gpu_tools.push(value.to_string()),
                _ => {}
            },
        }
    }

    let (total, available) = hardware::parse_meminfo(&meminfo);
    let total = total.ok_or_else(|| {
        TranslationError::WorkerError("探测输出中缺少 MemTotal".to_string())
    })?;
    let available = available.unwrap_or(total / 10 * 7);
    let cores = nproc.parse::<usize>().map_err(|_| {
        TranslationError::WorkerError(format!("无法解析 nproc 输出: '{}'", nproc))
    })?;
    if arch.is_empty() {
        return Err(TranslationError::WorkerError("探测输出中缺少架构信息".to_string()));
    }
    let gpu = hardware::gpu_from_tools(|tool| gpu_tools.iter().any(|t| t == tool));

    Ok(HardwareCapabilities::from_probe(arch, cores, total, available, gpu))
}

/// 在远程节点上执行探测
pub async fn probe(
    transport: &dyn SshTransport,
    endpoint: &SshEndpoint,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TranslationResult<HardwareCapabilities> {
    let output = transport
        .exec(endpoint, &probe_script(), None, timeout, cancel)
        .await?;
    if !output.success() {
        return Err(TranslationError::WorkerError(format!(
            "{} 硬件探测失败（退出码 {}）: {}",
            endpoint.host,
            output.exit_code,
            output.stderr.trim()
        )));
    }
    let caps = parse_probe_output(&output.stdout)?;
    tracing::info!(host = %endpoint.host, "节点硬件: {}", caps);
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::GB;

    const OUTPUT: &str = "MemTotal:       33554432 kB\nMemAvailable:   16777216 kB\n__NPROC__\n8\n__ARCH__\nx86_64\n__GPU__\nvulkaninfo\nnvidia-smi\n";

    #[test]
    fn test_parse_probe_output() {
        let caps = parse_probe_output(OUTPUT).unwrap();
        assert_eq!(caps.arch, "x86_64");
        assert_eq!(caps.cpu_cores, 8);
        assert_eq!(caps.total_ram, 32 * GB);
        assert_eq!(caps.available_ram, 16 * GB);
        assert_eq!(caps.gpu_type.as_deref(), Some("cuda"));
        assert_eq!(caps.max_concurrent, 4);
    }

    #[test]
    fn test_parse_probe_without_gpu() {
        let output = "MemTotal: 8388608 kB\n__NPROC__\n2\n__ARCH__\naarch64\n__GPU__\n";
        let caps = parse_probe_output(output).unwrap();
        assert!(!caps.has_gpu);
        assert!(caps.available_ram <= caps.total_ram);
    }

    #[test]
    fn test_parse_probe_rejects_garbage() {
        assert!(parse_probe_output("bash: cat: not found").is_err());
        assert!(parse_probe_output("MemTotal: 1024 kB\n__NPROC__\nmany\n__ARCH__\nx86_64\n").is_err());
    }

    #[test]
    fn test_probe_script_mentions_tools() {
        let script = probe_script();
        assert!(script.contains("/proc/meminfo"));
        assert!(script.contains("nvidia-smi rocm-smi vulkaninfo"));
    }
}
