//! 学習ループ。
//!
//! データ損失（正規化ドリフトの MSE）+ λ × 物理損失を Adam で最小化します。
//! 各エポック後に検証損失を評価し、改善のたびにチェックポイントを保存、
//! patience エポック改善が途絶えたら早期終了します。損失が NaN/Inf に
//! なった場合は `DivergenceError` で即座に中断し、最後に保存された
//! チェックポイントはそのまま残します。外部からの停止要求はエポック境界
//! でのみ確認します。

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::ExperimentConfig;
use crate::dataset::{Batch, Dataset, to_batches};
use crate::error::{PinnError, Result};
use crate::geometry::GeometryDescriptor;
use crate::model::DriftSurrogate;
use crate::pinn::PhysicsResidualEvaluator;
use burn::backend::{Autodiff, NdArray};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::Tensor;
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// 学習に使うバックエンド（CPU の NdArray + 自動微分）
pub type TrainBackend = Autodiff<NdArray<f32>>;

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// 検証損失が改善した
    Improved,
    /// 改善なし（まだ patience 内）
    Stalled,
    /// 改善なしが patience を超えた → 終了
    Halt,
}

/// 検証損失の改善を監視する早期終了カウンタ。
///
/// 改善なしのエポック数が patience を超えた時点で `Halt` を返します
/// （patience = 0 なら最初の非改善エポックで終了）。
#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    stalled: usize,
}

impl EarlyStopping {
    /// patience を指定して作成します。
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            stalled: 0,
        }
    }

    /// これまでの最良検証損失
    pub fn best(&self) -> f32 {
        self.best
    }

    /// 今エポックの検証損失を与え、判定を返します。
    pub fn update(&mut self, val_loss: f32) -> StopDecision {
        if val_loss < self.best {
            self.best = val_loss;
            self.stalled = 0;
            StopDecision::Improved
        } else {
            self.stalled += 1;
            if self.stalled > self.patience {
                StopDecision::Halt
            } else {
                StopDecision::Stalled
            }
        }
    }
}

/// 学習終了の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// 早期終了（収束）
    Converged {
        /// 終了を判定したエポック
        epoch: usize,
    },
    /// 最大エポックに到達
    MaxEpochsReached,
    /// 外部からの停止要求
    Cancelled {
        /// 停止を確認したエポック
        epoch: usize,
    },
}

/// 1エポック分の損失記録
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    /// エポック番号（1 始まり）
    pub epoch: usize,
    /// 学習損失（バッチ平均）
    pub train_loss: f32,
    /// 検証損失
    pub val_loss: f32,
    /// 物理損失成分（学習バッチ平均、重み λ 適用前）
    pub physics_loss: f32,
}

/// 学習の実行結果
#[derive(Debug)]
pub struct TrainReport {
    /// 終了理由
    pub outcome: TrainOutcome,
    /// 最良検証損失を記録したエポック
    pub best_epoch: usize,
    /// 最良検証損失
    pub best_val_loss: f32,
    /// エポックごとの損失履歴
    pub history: Vec<EpochStats>,
}

/// 非有限な損失を発散として扱います。
fn ensure_finite(loss: f32, epoch: usize) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(PinnError::Divergence { epoch, loss })
    }
}

/// 学習ループの実行器。
pub struct Trainer {
    config: ExperimentConfig,
    geometry: GeometryDescriptor,
    artifacts_dir: PathBuf,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl Trainer {
    /// 設定・構造記述子・成果物ディレクトリから実行器を作ります。
    pub fn new(
        config: ExperimentConfig,
        geometry: GeometryDescriptor,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        if config.n_stories != geometry.n_stories() {
            return Err(PinnError::DimensionMismatch {
                expected: config.n_stories,
                found: geometry.n_stories(),
            });
        }
        Ok(Self {
            config,
            geometry,
            artifacts_dir: artifacts_dir.into(),
            stop_flag: None,
        })
    }

    /// エポック境界で確認する停止フラグを設定します。
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// 学習を実行し、最良チェックポイントと損失履歴を残します。
    ///
    /// 再現性のため、解決済みの設定一式も成果物ディレクトリに書き出します。
    pub fn run(&self, dataset: &Dataset) -> Result<TrainReport> {
        let cfg = &self.config;
        let device = Default::default();
        let n = cfg.n_stories;

        std::fs::create_dir_all(&self.artifacts_dir)?;
        std::fs::write(
            self.artifacts_dir.join(crate::CONFIG_FILENAME),
            serde_json::to_string_pretty(cfg)?,
        )?;

        let train_batches = to_batches::<TrainBackend>(
            &dataset.train,
            &dataset.normalizer,
            cfg.batch_size,
            &device,
        )?;
        let val_batches = to_batches::<TrainBackend>(
            &dataset.val,
            &dataset.normalizer,
            cfg.batch_size,
            &device,
        )?;
        if train_batches.is_empty() || val_batches.is_empty() {
            return Err(PinnError::Data(
                "学習または検証パーティションが空です".into(),
            ));
        }

        let evaluator = PhysicsResidualEvaluator::<TrainBackend>::new(
            &self.geometry,
            dataset.dt,
            &device,
        );
        let norm_mean = Tensor::<TrainBackend, 1>::from_floats(
            dataset.normalizer.mean.as_slice(),
            &device,
        )
        .reshape([1, n]);
        let norm_std = Tensor::<TrainBackend, 1>::from_floats(
            dataset.normalizer.std.as_slice(),
            &device,
        )
        .reshape([1, n]);

        let mut model = DriftSurrogate::<TrainBackend>::new(
            &self.geometry,
            cfg.window_len,
            cfg.hidden_size,
            &device,
        );
        let mut optim = AdamConfig::new().init();
        let mut stopper = EarlyStopping::new(cfg.patience);
        let mut history = Vec::new();
        let mut best_epoch = 0;
        let mut outcome = TrainOutcome::MaxEpochsReached;
        let started = Instant::now();

        println!(
            "学習を開始します (N={}, λ={}, 学習 {} / 検証 {} サンプル) - バックエンド: NdArray (CPU)",
            n,
            cfg.lambda_physics,
            dataset.train.len(),
            dataset.val.len()
        );

        for epoch in 1..=cfg.max_epochs {
            if let Some(flag) = &self.stop_flag {
                if flag.load(Ordering::Relaxed) {
                    outcome = TrainOutcome::Cancelled { epoch };
                    println!("停止要求を受けたため epoch {epoch} で学習を中断します。");
                    break;
                }
            }

            let mut epoch_train = 0.0_f32;
            let mut epoch_phys = 0.0_f32;
            for batch in &train_batches {
                let (data_loss, phys_loss) =
                    self.losses(&model, &evaluator, batch, &norm_mean, &norm_std)?;
                let total =
                    data_loss + phys_loss.clone().mul_scalar(cfg.lambda_physics as f32);
                epoch_train += total.clone().into_scalar();
                epoch_phys += phys_loss.into_scalar();

                let grads = total.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(cfg.learning_rate, model, grads);
            }
            let train_loss = epoch_train / train_batches.len() as f32;
            let physics_loss = epoch_phys / train_batches.len() as f32;
            ensure_finite(train_loss, epoch)?;

            let mut epoch_val = 0.0_f32;
            for batch in &val_batches {
                let (data_loss, phys_loss) =
                    self.losses(&model, &evaluator, batch, &norm_mean, &norm_std)?;
                let total = data_loss + phys_loss.mul_scalar(cfg.lambda_physics as f32);
                epoch_val += total.into_scalar();
            }
            let val_loss = epoch_val / val_batches.len() as f32;
            ensure_finite(val_loss, epoch)?;

            history.push(EpochStats {
                epoch,
                train_loss,
                val_loss,
                physics_loss,
            });
            if epoch % 50 == 0 {
                println!(
                    "[Epoch {epoch}] Train Loss: {train_loss:.6}, Val Loss: {val_loss:.6}, Physics Loss: {physics_loss:.6}"
                );
            }

            match stopper.update(val_loss) {
                StopDecision::Improved => {
                    best_epoch = epoch;
                    let meta = CheckpointMeta::new(
                        n,
                        cfg.window_len,
                        cfg.hidden_size,
                        epoch,
                        val_loss,
                    );
                    checkpoint::save_checkpoint(model.clone(), &meta, &self.artifacts_dir)?;
                }
                StopDecision::Stalled => {}
                StopDecision::Halt => {
                    outcome = TrainOutcome::Converged { epoch };
                    println!(
                        "検証損失が {} エポック改善しなかったため epoch {epoch} で早期終了します。",
                        cfg.patience
                    );
                    break;
                }
            }
        }

        println!("学習が完了しました。");
        println!("=> 学習時間: {:.2?}", started.elapsed());
        println!(
            "=> 最良検証損失: {:.6} (epoch {best_epoch})",
            stopper.best()
        );

        if let Err(e) = plot_loss_history(&history, &self.artifacts_dir.join(crate::LOSS_PLOT_FILENAME)) {
            eprintln!("損失グラフの描画に失敗しました: {e}");
        }

        Ok(TrainReport {
            outcome,
            best_epoch,
            best_val_loss: stopper.best(),
            history,
        })
    }

    /// 1バッチ分の (データ損失, 物理損失) を計算します。
    fn losses(
        &self,
        model: &DriftSurrogate<TrainBackend>,
        evaluator: &PhysicsResidualEvaluator<TrainBackend>,
        batch: &Batch<TrainBackend>,
        norm_mean: &Tensor<TrainBackend, 2>,
        norm_std: &Tensor<TrainBackend, 2>,
    ) -> Result<(Tensor<TrainBackend, 1>, Tensor<TrainBackend, 1>)> {
        let [b, n] = batch.target.dims();
        let disp = model.forward(batch.waveform.clone());
        let pred = model.peak_drift(disp.clone());
        let pred_norm = pred
            .sub(norm_mean.clone().expand([b, n]))
            .div(norm_std.clone().expand([b, n]));
        let data_loss = MseLoss::new().forward(pred_norm, batch.target.clone(), Reduction::Mean);
        let phys_loss = evaluator.loss_from_displacement(disp, batch.waveform.clone())?;
        Ok((data_loss, phys_loss))
    }
}

/// 学習・検証損失の履歴を PNG に描画します。
fn plot_loss_history(history: &[EpochStats], path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    if history.is_empty() {
        return Ok(());
    }
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let max_log = history
        .iter()
        .map(|s| s.train_loss.max(s.val_loss))
        .fold(f32::MIN, f32::max)
        .log10();
    let min_log = history
        .iter()
        .map(|s| s.train_loss.min(s.val_loss))
        .fold(f32::MAX, f32::min)
        .log10()
        - 0.5;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..history.len(), min_log..max_log)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epochs")
        .draw()?;
    chart
        .draw_series(LineSeries::new(
            history.iter().enumerate().map(|(i, s)| (i, s.train_loss.log10())),
            &RED,
        ))?
        .label("Train Loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(
            history.iter().enumerate().map(|(i, s)| (i, s.val_loss.log10())),
            &BLUE,
        ))?
        .label("Val Loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetBuilder;
    use crate::geometry::StoryParam;
    use crate::simulate;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn patience_zero_halts_on_first_non_improving_epoch() {
        let mut stopper = EarlyStopping::new(0);
        assert_eq!(stopper.update(1.0), StopDecision::Improved);
        assert_eq!(stopper.update(0.5), StopDecision::Improved);
        assert_eq!(stopper.update(0.6), StopDecision::Halt);
    }

    #[test]
    fn patience_two_halts_after_three_non_improving_epochs() {
        let mut stopper = EarlyStopping::new(2);
        assert_eq!(stopper.update(1.0), StopDecision::Improved);
        assert_eq!(stopper.update(1.1), StopDecision::Stalled);
        assert_eq!(stopper.update(1.2), StopDecision::Stalled);
        assert_eq!(stopper.update(1.3), StopDecision::Halt);
        assert!((stopper.best() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn improvement_resets_the_patience_counter() {
        let mut stopper = EarlyStopping::new(1);
        stopper.update(1.0);
        assert_eq!(stopper.update(1.5), StopDecision::Stalled);
        assert_eq!(stopper.update(0.9), StopDecision::Improved);
        assert_eq!(stopper.update(1.0), StopDecision::Stalled);
        assert_eq!(stopper.update(1.0), StopDecision::Halt);
    }

    #[test]
    fn non_finite_loss_is_a_divergence_error() {
        assert!(ensure_finite(0.5, 3).is_ok());
        let err = ensure_finite(f32::NAN, 7).unwrap_err();
        match err {
            PinnError::Divergence { epoch, .. } => assert_eq!(epoch, 7),
            other => panic!("想定外のエラー種別: {other:?}"),
        }
        assert!(ensure_finite(f32::INFINITY, 1).is_err());
    }

    #[test]
    fn short_training_run_persists_a_checkpoint() {
        let geometry = GeometryDescriptor::new(
            2,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(50.0),
            0.05,
            0.002,
            3.0,
        )
        .unwrap();
        let cfg = ExperimentConfig {
            window_len: 16,
            window_stride: 16,
            hidden_size: 8,
            batch_size: 8,
            max_epochs: 3,
            patience: 5,
            ..ExperimentConfig::for_stories(2)
        };
        let mut rng = StdRng::seed_from_u64(1);
        let samples: Vec<_> = (0..6)
            .map(|i| {
                let rec = simulate::generate_ground_motion(
                    &mut rng,
                    format!("rec_{i}"),
                    80,
                    0.02,
                );
                simulate::simulate_response(&geometry, &rec).unwrap()
            })
            .collect();
        let dataset = DatasetBuilder::new(cfg.clone()).build(&samples).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let trainer = Trainer::new(cfg, geometry.clone(), dir.path()).unwrap();
        let report = trainer.run(&dataset).unwrap();

        assert!(report.history.len() <= 3);
        assert!(report.best_val_loss.is_finite());
        assert!(dir.path().join(crate::MODEL_FILENAME).exists());
        assert!(dir.path().join(crate::CHECKPOINT_META_FILENAME).exists());

        // 解決済み設定も成果物として残る
        let saved: ExperimentConfig = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(crate::CONFIG_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.n_stories, 2);

        // 保存されたチェックポイントは同じ N の記述子で読み戻せる
        let device = Default::default();
        let (model, meta) = crate::checkpoint::load_checkpoint::<burn::backend::NdArray<f32>>(
            dir.path(),
            &geometry,
            &device,
        )
        .unwrap();
        assert_eq!(model.n_stories(), 2);
        assert_eq!(meta.n_stories, 2);
    }

    #[test]
    fn divergent_run_fails_but_keeps_the_last_checkpoint() {
        let geometry = GeometryDescriptor::new(
            2,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(50.0),
            0.05,
            0.002,
            3.0,
        )
        .unwrap();
        let cfg = ExperimentConfig {
            window_len: 16,
            window_stride: 16,
            hidden_size: 8,
            batch_size: 8,
            max_epochs: 2,
            patience: 5,
            ..ExperimentConfig::for_stories(2)
        };
        let mut rng = StdRng::seed_from_u64(6);
        let samples: Vec<_> = (0..6)
            .map(|i| {
                let rec = simulate::generate_ground_motion(
                    &mut rng,
                    format!("rec_{i}"),
                    80,
                    0.02,
                );
                simulate::simulate_response(&geometry, &rec).unwrap()
            })
            .collect();
        let dataset = DatasetBuilder::new(cfg.clone()).build(&samples).unwrap();

        // まず健全な学習でチェックポイントを残す
        let dir = tempfile::tempdir().unwrap();
        Trainer::new(cfg.clone(), geometry.clone(), dir.path())
            .unwrap()
            .run(&dataset)
            .unwrap();
        let device = Default::default();
        let (_, meta_before) = crate::checkpoint::load_checkpoint::<burn::backend::NdArray<f32>>(
            dir.path(),
            &geometry,
            &device,
        )
        .unwrap();

        // 桁外れの学習率で重みを吹き飛ばし、損失を非有限にする
        let bad_cfg = ExperimentConfig {
            learning_rate: 1e30,
            max_epochs: 10,
            ..cfg
        };
        let err = Trainer::new(bad_cfg, geometry.clone(), dir.path())
            .unwrap()
            .run(&dataset)
            .unwrap_err();
        assert!(matches!(err, PinnError::Divergence { .. }), "{err:?}");

        // 発散前に保存されたチェックポイントはそのまま読み戻せる
        let (model, meta_after) = crate::checkpoint::load_checkpoint::<burn::backend::NdArray<f32>>(
            dir.path(),
            &geometry,
            &device,
        )
        .unwrap();
        assert_eq!(model.n_stories(), 2);
        assert_eq!(meta_after.epoch, meta_before.epoch);
        assert!((meta_after.validation_loss - meta_before.validation_loss).abs() < 1e-9);
    }

    #[test]
    fn cancellation_is_checked_at_the_epoch_boundary() {
        let geometry = GeometryDescriptor::new(
            1,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(50.0),
            0.05,
            0.002,
            3.0,
        )
        .unwrap();
        let cfg = ExperimentConfig {
            window_len: 16,
            window_stride: 16,
            hidden_size: 8,
            batch_size: 8,
            max_epochs: 100,
            patience: 100,
            ..ExperimentConfig::for_stories(1)
        };
        let mut rng = StdRng::seed_from_u64(2);
        let samples: Vec<_> = (0..5)
            .map(|i| {
                let rec = simulate::generate_ground_motion(
                    &mut rng,
                    format!("rec_{i}"),
                    60,
                    0.02,
                );
                simulate::simulate_response(&geometry, &rec).unwrap()
            })
            .collect();
        let dataset = DatasetBuilder::new(cfg.clone()).build(&samples).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let trainer = Trainer::new(cfg, geometry, dir.path())
            .unwrap()
            .with_stop_flag(flag);
        let report = trainer.run(&dataset).unwrap();
        assert_eq!(report.outcome, TrainOutcome::Cancelled { epoch: 1 });
        assert!(report.history.is_empty());
    }
}
