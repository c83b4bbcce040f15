//! 学習済みモデルの評価。
//!
//! テストパーティションに対して全体・階別の R²・RMSE・MAE を計算し、
//! 1サンプルずつの推論レイテンシ（前処理 + 順伝播）を測定します。
//! RMSE はテスト集合で観測された最大ドリフトに対する割合で表します。
//! 結果は機械可読な JSON (`metrics.json`) として書き出します。
//! 評価は読み取り専用で、モデルにもデータセットにも副作用はありません。

use crate::dataset::TrainingExample;
use crate::error::{PinnError, Result};
use crate::model::DriftSurrogate;
use burn::backend::NdArray;
use burn::tensor::Tensor;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;

/// 評価に使うバックエンド（CPU の NdArray）
pub type EvalBackend = NdArray<f32>;

/// R² / RMSE / MAE の組
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricBlock {
    /// 決定係数
    pub r2: f64,
    /// 最大観測ドリフトに対する割合で表した RMSE
    pub rmse_fraction: f64,
    /// 平均絶対誤差（物理単位）
    pub mae: f64,
}

/// 階別の指標
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMetrics {
    /// 階番号（1 始まり）
    pub story: usize,
    /// 指標
    #[serde(flatten)]
    pub metrics: MetricBlock,
}

/// レイテンシ統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyStats {
    /// 平均 [ms]
    pub mean_ms: f64,
    /// 99 パーセンタイル [ms]
    pub p99_ms: f64,
    /// スループット [回/s]
    pub throughput_per_sec: f64,
}

/// 評価レポート一式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// 階数 N
    pub n_stories: usize,
    /// テストサンプル数
    pub n_test_examples: usize,
    /// 全階をまとめた指標
    pub overall: MetricBlock,
    /// 階別の指標
    pub per_story: Vec<StoryMetrics>,
    /// レイテンシ統計
    pub latency: LatencyStats,
    /// 作成時刻 (RFC 3339)
    pub created_at: String,
}

/// テストパーティションを評価するレポータ。
pub struct EvaluationReporter<'a> {
    model: &'a DriftSurrogate<EvalBackend>,
    device: <EvalBackend as burn::prelude::Backend>::Device,
}

impl<'a> EvaluationReporter<'a> {
    /// 学習済みモデルからレポータを作ります。
    pub fn new(model: &'a DriftSurrogate<EvalBackend>) -> Self {
        Self {
            model,
            device: Default::default(),
        }
    }

    /// 1サンプルの予測（物理単位のドリフトベクトル）。
    fn predict_one(&self, example: &TrainingExample) -> Vec<f32> {
        let waveform = Tensor::<EvalBackend, 1>::from_floats(
            example.waveform.as_slice(),
            &self.device,
        )
        .reshape([1, example.waveform.len()]);
        self.model
            .predict(waveform)
            .into_data()
            .iter::<f32>()
            .collect()
    }

    /// テストパーティション全体を評価します。
    ///
    /// `latency_iters` 回の単発推論でレイテンシを測定します（テスト
    /// サンプルを循環使用）。
    pub fn evaluate(&self, test: &[TrainingExample], latency_iters: usize) -> Result<MetricsReport> {
        if test.is_empty() {
            return Err(PinnError::Data("テストパーティションが空です".into()));
        }
        let n = self.model.n_stories();
        for ex in test {
            if ex.target.len() != n {
                return Err(PinnError::Shape(format!(
                    "記録 '{}' の目標次元 {} がモデルの N={n} と一致しません",
                    ex.record_id,
                    ex.target.len()
                )));
            }
        }

        let predictions: Vec<Vec<f32>> = test.iter().map(|ex| self.predict_one(ex)).collect();
        let actuals: Vec<&[f32]> = test.iter().map(|ex| ex.target.as_slice()).collect();

        let per_story = (0..n)
            .map(|story| {
                let pred: Vec<f64> = predictions.iter().map(|p| p[story] as f64).collect();
                let act: Vec<f64> = actuals.iter().map(|a| a[story] as f64).collect();
                StoryMetrics {
                    story: story + 1,
                    metrics: metric_block(&pred, &act, max_abs(&actuals)),
                }
            })
            .collect();

        let all_pred: Vec<f64> = predictions
            .iter()
            .flat_map(|p| p.iter().map(|&v| v as f64))
            .collect();
        let all_act: Vec<f64> = actuals
            .iter()
            .flat_map(|a| a.iter().map(|&v| v as f64))
            .collect();
        let overall = metric_block(&all_pred, &all_act, max_abs(&actuals));

        let latency = self.measure_latency(test, latency_iters);

        Ok(MetricsReport {
            n_stories: n,
            n_test_examples: test.len(),
            overall,
            per_story,
            latency,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// 単発推論のレイテンシ（前処理 + 順伝播）を測定します。
    fn measure_latency(&self, test: &[TrainingExample], iters: usize) -> LatencyStats {
        let iters = iters.max(1);
        let mut times_ms = Vec::with_capacity(iters);
        for i in 0..iters {
            let example = &test[i % test.len()];
            let start = Instant::now();
            // 前処理（テンソル化）も計測対象に含める
            let _ = self.predict_one(example);
            times_ms.push(start.elapsed().as_secs_f64() * 1e3);
        }
        times_ms.sort_by(|a, b| a.total_cmp(b));
        let mean_ms = times_ms.iter().sum::<f64>() / times_ms.len() as f64;
        let p99_idx = ((times_ms.len() - 1) as f64 * 0.99).round() as usize;
        LatencyStats {
            mean_ms,
            p99_ms: times_ms[p99_idx],
            throughput_per_sec: if mean_ms > 0.0 { 1e3 / mean_ms } else { 0.0 },
        }
    }
}

fn max_abs(actuals: &[&[f32]]) -> f64 {
    actuals
        .iter()
        .flat_map(|a| a.iter())
        .fold(0.0_f64, |m, &v| m.max((v as f64).abs()))
}

/// R²・RMSE（最大観測ドリフト比）・MAE を計算します。
fn metric_block(pred: &[f64], actual: &[f64], max_drift: f64) -> MetricBlock {
    let count = actual.len() as f64;
    let mean_actual = actual.iter().sum::<f64>() / count;
    let ss_res: f64 = pred
        .iter()
        .zip(actual.iter())
        .map(|(p, a)| (p - a).powi(2))
        .sum();
    let ss_tot: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
    let r2 = if ss_tot > 1e-18 {
        1.0 - ss_res / ss_tot
    } else {
        0.0
    };
    let rmse = (ss_res / count).sqrt();
    let mae = pred
        .iter()
        .zip(actual.iter())
        .map(|(p, a)| (p - a).abs())
        .sum::<f64>()
        / count;
    MetricBlock {
        r2,
        rmse_fraction: if max_drift > 0.0 { rmse / max_drift } else { rmse },
        mae,
    }
}

/// レポートを JSON として書き出します。
pub fn write_report(report: &MetricsReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}
