//! 本地模型注册表
//!
//! 固定的 GGUF 模型目录，用于按内存和语言为 llama.cpp 后端挑选模型。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::translation::error::{TranslationError, TranslationResult};

pub const GB: u64 = 1024 * 1024 * 1024;

/// 翻译质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelQuality {
    Moderate,
    Good,
    Excellent,
}

impl ModelQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelQuality::Moderate => "moderate",
            ModelQuality::Good => "good",
            ModelQuality::Excellent => "excellent",
        }
    }

    fn score(&self) -> f64 {
        match self {
            ModelQuality::Moderate => 10.0,
            ModelQuality::Good => 20.0,
            ModelQuality::Excellent => 30.0,
        }
    }
}

impl fmt::Display for ModelQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模型信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub parameters: u64,
    pub min_ram: u64,
    pub recommended_ram: u64,
    pub quant_type: String,
    pub file_name: String,
    pub source_url: String,
    pub languages: Vec<String>,
    pub quality: ModelQuality,
    pub context_length: u32,
    pub optimized_for: String,
    pub translation_optimized: bool,
}

impl ModelInfo {
    pub fn supports_language(&self, code: &str) -> bool {
        self.languages.iter().any(|l| l == code)
    }

    pub fn supports_all(&self, codes: &[&str]) -> bool {
        codes.iter().all(|code| self.supports_language(code))
    }
}

struct CatalogueEntry {
    id: &'static str,
    name: &'static str,
    params_m: u64,
    min_gb: u64,
    rec_gb: u64,
    quant: &'static str,
    file: &'static str,
    repo: &'static str,
    langs: &'static [&'static str],
    quality: ModelQuality,
    context: u32,
    optimized_for: &'static str,
    translation: bool,
}

const BROAD: &[&str] = &[
    "en", "ru", "sr", "hr", "bs", "uk", "pl", "cs", "bg", "mk", "de", "fr", "es", "it", "pt",
    "zh", "ja", "ko", "ar", "hi", "tr", "vi",
];
const AYA: &[&str] = &[
    "en", "ru", "uk", "pl", "cs", "de", "fr", "es", "it", "pt", "nl", "ro", "el", "zh", "ja",
    "ko", "ar", "hi", "tr", "vi", "id", "fa", "he",
];
const EUROPEAN: &[&str] = &["en", "fr", "de", "es", "it", "pt", "ru"];
const SMALL: &[&str] = &["en", "es", "fr", "de", "it", "pt", "zh", "ja"];

const CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry {
        id: "hunyuan-mt-7b-q4",
        name: "Hunyuan-MT 7B (Q4_K_M)",
        params_m: 7_000,
        min_gb: 6,
        rec_gb: 8,
        quant: "Q4_K_M",
        file: "Hunyuan-MT-7B.Q4_K_M.gguf",
        repo: "https://huggingface.co/tencent/Hunyuan-MT-7B",
        langs: BROAD,
        quality: ModelQuality::Good,
        context: 8192,
        optimized_for: "Professional Translation",
        translation: true,
    },
    CatalogueEntry {
        id: "hunyuan-mt-7b-q8",
        name: "Hunyuan-MT 7B (Q8_0)",
        params_m: 7_000,
        min_gb: 9,
        rec_gb: 12,
        quant: "Q8_0",
        file: "Hunyuan-MT-7B.Q8_0.gguf",
        repo: "https://huggingface.co/tencent/Hunyuan-MT-7B",
        langs: BROAD,
        quality: ModelQuality::Excellent,
        context: 8192,
        optimized_for: "Professional Translation",
        translation: true,
    },
    CatalogueEntry {
        id: "aya-23-8b-q4",
        name: "Aya 23 8B (Q4_K_M)",
        params_m: 8_000,
        min_gb: 7,
        rec_gb: 10,
        quant: "Q4_K_M",
        file: "aya-23-8B.Q4_K_M.gguf",
        repo: "https://huggingface.co/CohereForAI/aya-23-8B",
        langs: AYA,
        quality: ModelQuality::Good,
        context: 8192,
        optimized_for: "Multilingual Translation",
        translation: true,
    },
    CatalogueEntry {
        id: "qwen2.5-7b-instruct-q4",
        name: "Qwen2.5 7B Instruct (Q4_K_M)",
        params_m: 7_600,
        min_gb: 6,
        rec_gb: 8,
        quant: "Q4_K_M",
        file: "qwen2.5-7b-instruct-q4_k_m.gguf",
        repo: "https://huggingface.co/Qwen/Qwen2.5-7B-Instruct-GGUF",
        langs: BROAD,
        quality: ModelQuality::Good,
        context: 32768,
        optimized_for: "General Instruction",
        translation: false,
    },
    CatalogueEntry {
        id: "qwen2.5-14b-instruct-q4",
        name: "Qwen2.5 14B Instruct (Q4_K_M)",
        params_m: 14_700,
        min_gb: 10,
        rec_gb: 16,
        quant: "Q4_K_M",
        file: "qwen2.5-14b-instruct-q4_k_m.gguf",
        repo: "https://huggingface.co/Qwen/Qwen2.5-14B-Instruct-GGUF",
        langs: BROAD,
        quality: ModelQuality::Excellent,
        context: 32768,
        optimized_for: "General Instruction",
        translation: false,
    },
    CatalogueEntry {
        id: "qwen2.5-27b-instruct-q4",
        name: "Qwen2.5 27B Instruct (Q4_K_M)",
        params_m: 27_000,
        min_gb: 18,
        rec_gb: 24,
        quant: "Q4_K_M",
        file: "qwen2.5-27b-instruct-q4_k_m.gguf",
        repo: "https://huggingface.co/Qwen/Qwen2.5-32B-Instruct-GGUF",
        langs: BROAD,
        quality: ModelQuality::Excellent,
        context: 32768,
        optimized_for: "General Instruction",
        translation: false,
    },
    CatalogueEntry {
        id: "mistral-7b-instruct-q4",
        name: "Mistral 7B Instruct v0.3 (Q4_K_M)",
        params_m: 7_200,
        min_gb: 6,
        rec_gb: 8,
        quant: "Q4_K_M",
        file: "Mistral-7B-Instruct-v0.3.Q4_K_M.gguf",
        repo: "https://huggingface.co/mistralai/Mistral-7B-Instruct-v0.3",
        langs: EUROPEAN,
        quality: ModelQuality::Moderate,
        context: 32768,
        optimized_for: "General Instruction",
        translation: false,
    },
    CatalogueEntry {
        id: "phi-3-mini-4k-q4",
        name: "Phi-3 Mini 4K Instruct (Q4)",
        params_m: 3_800,
        min_gb: 3,
        rec_gb: 4,
        quant: "Q4_K_M",
        file: "Phi-3-mini-4k-instruct-q4.gguf",
        repo: "https://huggingface.co/microsoft/Phi-3-mini-4k-instruct-gguf",
        langs: SMALL,
        quality: ModelQuality::Moderate,
        context: 4096,
        optimized_for: "Lightweight Assistant",
        translation: false,
    },
    CatalogueEntry {
        id: "gemma-2-9b-it-q4",
        name: "Gemma 2 9B Instruct (Q4_K_M)",
        params_m: 9_200,
        min_gb: 7,
        rec_gb: 10,
        quant: "Q4_K_M",
        file: "gemma-2-9b-it-Q4_K_M.gguf",
        repo: "https://huggingface.co/google/gemma-2-9b-it",
        langs: BROAD,
        quality: ModelQuality::Good,
        context: 8192,
        optimized_for: "General Instruction",
        translation: false,
    },
];

/// 模型注册表
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        let models = CATALOGUE
            .iter()
            .map(|entry| {
                let info = ModelInfo {
                    id: entry.id.to_string(),
                    name: entry.name.to_string(),
                    parameters: entry.params_m * 1_000_000,
                    min_ram: entry.min_gb * GB,
                    recommended_ram: entry.rec_gb * GB,
                    quant_type: entry.quant.to_string(),
                    file_name: entry.file.to_string(),
                    source_url: entry.repo.to_string(),
                    languages: entry.langs.iter().map(|l| l.to_string()).collect(),
                    quality: entry.quality,
                    context_length: entry.context,
                    optimized_for: entry.optimized_for.to_string(),
                    translation_optimized: entry.translation,
                };
                (info.id.clone(), info)
            })
            .collect();
        Self { models }
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.get(id)
    }

    /// 按 id 排序的全部模型
    pub fn list(&self) -> Vec<&ModelInfo> {
        let mut all: Vec<&ModelInfo> = self.models.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// 支持全部给定语言的模型；空列表返回全部
    pub fn filter_by_language(&self, languages: &[&str]) -> Vec<&ModelInfo> {
        self.list()
            .into_iter()
            .filter(|m| m.supports_all(languages))
            .collect()
    }

    pub fn filter_by_ram(&self, max_ram: u64) -> Vec<&ModelInfo> {
        self.list()
            .into_iter()
            .filter(|m| m.min_ram <= max_ram)
            .collect()
    }

    /// 模型得分：翻译专用优先，其次质量，再次语言覆盖
    pub fn score(&self, model: &ModelInfo, languages: &[&str], max_ram: u64, has_gpu: bool) -> f64 {
        let mut score = 0.0;
        if model.translation_optimized {
            score += 100.0;
        }
        score += model.quality.score();

        let covered = languages.iter().filter(|l| model.supports_language(l)).count();
        score += covered as f64 * 5.0;
        score += model.languages.len().min(30) as f64 * 0.1;

        let billions = model.parameters as f64 / 1e9;
        score += billions * if has_gpu { 0.5 } else { 0.2 };

        if model.recommended_ram <= max_ram {
            score += 5.0;
        }
        score
    }

    /// 在内存限制内选出最适合的模型
    pub fn find_best_model(
        &self,
        max_ram: u64,
        languages: &[&str],
        has_gpu: bool,
    ) -> TranslationResult<&ModelInfo> {
        self.filter_by_ram(max_ram)
            .into_iter()
            .filter(|m| m.supports_all(languages))
            .map(|m| (self.score(m, languages, max_ram, has_gpu), m))
            .max_by(|(a, ma), (b, mb)| a.total_cmp(b).then_with(|| mb.id.cmp(&ma.id)))
            .map(|(_, m)| m)
            .ok_or_else(|| {
                TranslationError::NoBackendAvailable(format!(
                    "没有适合 {:.1} GB 内存且支持 {:?} 的本地模型",
                    max_ram as f64 / GB as f64,
                    languages
                ))
            })
    }
}
