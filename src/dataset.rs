//! データセット構築。
//!
//! 取り込んだ `SimulationSample` の列を、レコード単位で train/val/test に
//! 分割し、地動波形のスライディングウィンドウで水増しした固定形状の
//! `TrainingExample` に変換します。分割は必ずレコード単位で行い、同一
//! レコード由来のウィンドウが複数のパーティションに跨ることはありません
//! （リーク防止）。目的変数の正規化統計は train のみで推定して凍結し、
//! val/test には同じ統計を適用します。

use crate::config::ExperimentConfig;
use crate::error::{PinnError, Result};
use crate::ingest::SimulationSample;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// 1つの学習サンプル: 入力波形ウィンドウと各階の目標最大層間変形角。
#[derive(Debug, Clone)]
pub struct TrainingExample {
    /// 由来レコードの識別子（パーティション所属はこの単位で決まる）
    pub record_id: String,
    /// 地動加速度ウィンドウ（長さ window_len）
    pub waveform: Vec<f32>,
    /// 目標最大層間変形角（長さ N、物理単位）
    pub target: Vec<f32>,
    /// 時間刻み Δt
    pub dt: f32,
}

/// 階ごとの目的変数正規化（平均・標準偏差）。train で推定後は凍結。
#[derive(Debug, Clone)]
pub struct TargetNormalizer {
    /// 階ごとの平均
    pub mean: Vec<f32>,
    /// 階ごとの標準偏差（ゼロ分散の階は 1.0）
    pub std: Vec<f32>,
}

impl TargetNormalizer {
    /// train パーティションから統計を推定します。
    pub fn fit(train: &[TrainingExample], n_stories: usize) -> Result<Self> {
        if train.is_empty() {
            return Err(PinnError::Data(
                "正規化統計の推定に使える学習サンプルがありません".into(),
            ));
        }
        let count = train.len() as f32;
        let mut mean = vec![0.0_f32; n_stories];
        for ex in train {
            for (i, &v) in ex.target.iter().enumerate() {
                mean[i] += v;
            }
        }
        for m in &mut mean {
            *m /= count;
        }
        let mut var = vec![0.0_f32; n_stories];
        for ex in train {
            for (i, &v) in ex.target.iter().enumerate() {
                var[i] += (v - mean[i]).powi(2);
            }
        }
        let std = var
            .iter()
            .map(|&v| {
                let s = (v / count).sqrt();
                if s > 1e-12 { s } else { 1.0 }
            })
            .collect();
        Ok(Self { mean, std })
    }

    /// 1サンプルの目標を正規化します。
    pub fn normalize(&self, target: &[f32]) -> Vec<f32> {
        target
            .iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(&v, (&m, &s))| (v - m) / s)
            .collect()
    }

    /// 正規化の逆変換。
    pub fn denormalize(&self, normalized: &[f32]) -> Vec<f32> {
        normalized
            .iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(&v, (&m, &s))| v * s + m)
            .collect()
    }
}

/// 構築済みデータセット。パーティションと凍結済み正規化統計を保持します。
#[derive(Debug)]
pub struct Dataset {
    /// 学習パーティション
    pub train: Vec<TrainingExample>,
    /// 検証パーティション
    pub val: Vec<TrainingExample>,
    /// テストパーティション
    pub test: Vec<TrainingExample>,
    /// train で推定した正規化統計（凍結）
    pub normalizer: TargetNormalizer,
    /// 階数 N
    pub n_stories: usize,
    /// 全サンプル共通の Δt
    pub dt: f32,
}

/// ミニバッチ（固定形状テンソル）。
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// 入力波形 [B, W]（地動加速度そのもの）
    pub waveform: Tensor<B, 2>,
    /// 正規化済み目標 [B, N]
    pub target: Tensor<B, 2>,
}

/// レコード単位の分割＋ウィンドウ化を行うビルダ。
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    config: ExperimentConfig,
}

impl DatasetBuilder {
    /// 検証済みの設定からビルダを作ります。
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    /// サンプル列からデータセットを構築します。
    pub fn build(&self, samples: &[SimulationSample]) -> Result<Dataset> {
        let cfg = &self.config;
        let n = cfg.n_stories;
        if samples.is_empty() {
            return Err(PinnError::Data("サンプルが1件もありません".into()));
        }
        for s in samples {
            if s.n_stories() != n {
                return Err(PinnError::DimensionMismatch {
                    expected: n,
                    found: s.n_stories(),
                });
            }
        }
        let dt = samples[0].record.dt;
        for s in samples {
            if (s.record.dt - dt).abs() > 1e-9 {
                return Err(PinnError::Data(format!(
                    "Δt が混在しています: 記録 '{}' は {} (期待 {dt})",
                    s.record.id, s.record.dt
                )));
            }
        }

        let (train_idx, val_idx, test_idx) = split_record_indices(
            samples.len(),
            cfg.train_ratio,
            cfg.val_ratio,
            cfg.test_ratio,
            cfg.seed,
        )?;

        let windows = |indices: &[usize]| -> Vec<TrainingExample> {
            indices
                .iter()
                .flat_map(|&i| self.windows_of(&samples[i]))
                .collect()
        };
        let train = windows(&train_idx);
        let val = windows(&val_idx);
        let test = windows(&test_idx);

        let normalizer = TargetNormalizer::fit(&train, n)?;
        Ok(Dataset {
            train,
            val,
            test,
            normalizer,
            n_stories: n,
            dt,
        })
    }

    /// 1レコードから固定長ウィンドウ群を切り出します。
    ///
    /// 記録がウィンドウ長に満たない場合は末尾をゼロ詰めした1ウィンドウを
    /// 返します。目標はレコード全体の最大層間変形角です。
    fn windows_of(&self, sample: &SimulationSample) -> Vec<TrainingExample> {
        let w = self.config.window_len;
        let stride = self.config.window_stride;
        let target = sample.peak_drift(self.config.story_height);
        let accel = &sample.record.accel;
        let dt = sample.record.dt;

        if accel.len() < w {
            let mut padded = accel.clone();
            padded.resize(w, 0.0);
            return vec![TrainingExample {
                record_id: sample.record.id.clone(),
                waveform: padded,
                target,
                dt,
            }];
        }
        (0..=(accel.len() - w))
            .step_by(stride)
            .map(|start| TrainingExample {
                record_id: sample.record.id.clone(),
                waveform: accel[start..start + w].to_vec(),
                target: target.clone(),
                dt,
            })
            .collect()
    }
}

/// レコード添字をシャッフルして 3 分割します。
///
/// 比率が正のパーティションには最低1レコードを割り当てます。それが
/// 不可能な場合（レコード不足）は黙って空にせず `DataError` を返します。
fn split_record_indices(
    n_records: usize,
    train_ratio: f64,
    val_ratio: f64,
    test_ratio: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>, Vec<usize>)> {
    let mut indices: Vec<usize> = (0..n_records).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let want = |ratio: f64| -> usize {
        if ratio <= 0.0 {
            0
        } else {
            ((n_records as f64 * ratio).round() as usize).max(1)
        }
    };
    let n_val = want(val_ratio);
    let n_test = want(test_ratio);
    let required = n_val + n_test + usize::from(train_ratio > 0.0);
    if n_records < required {
        return Err(PinnError::Data(format!(
            "レコード数 {n_records} では分割 {train_ratio}/{val_ratio}/{test_ratio} を満たせません (最低 {required} 件必要)"
        )));
    }
    // 丸めの誤差は train 側で吸収する
    let n_train = n_records - n_val - n_test;

    let train = indices[..n_train].to_vec();
    let val = indices[n_train..n_train + n_val].to_vec();
    let test = indices[n_train + n_val..].to_vec();
    Ok((train, val, test))
}

/// サンプル列を固定形状のミニバッチへ変換します。
///
/// すべてのサンプルの目標長（= N）とウィンドウ長が揃っていることを検査し、
/// 揃っていなければ `ShapeError` を返します。
pub fn to_batches<B: Backend>(
    examples: &[TrainingExample],
    normalizer: &TargetNormalizer,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<Batch<B>>> {
    if examples.is_empty() {
        return Ok(Vec::new());
    }
    let w = examples[0].waveform.len();
    let n = examples[0].target.len();
    for ex in examples {
        if ex.waveform.len() != w || ex.target.len() != n {
            return Err(PinnError::Shape(format!(
                "記録 '{}' のサンプル形状 (W={}, N={}) がバッチの (W={w}, N={n}) と一致しません",
                ex.record_id,
                ex.waveform.len(),
                ex.target.len()
            )));
        }
    }
    let mut batches = Vec::new();
    for chunk in examples.chunks(batch_size) {
        let b = chunk.len();
        let mut waveform = Vec::with_capacity(b * w);
        let mut target = Vec::with_capacity(b * n);
        for ex in chunk {
            waveform.extend_from_slice(&ex.waveform);
            target.extend(normalizer.normalize(&ex.target));
        }
        batches.push(Batch {
            waveform: Tensor::<B, 1>::from_floats(waveform.as_slice(), device).reshape([b, w]),
            target: Tensor::<B, 1>::from_floats(target.as_slice(), device).reshape([b, n]),
        });
    }
    Ok(batches)
}
