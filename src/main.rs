//! # 物理情報ドリフトサロゲート (drift-pinn)
//!
//! `burn` フレームワークを使用して、地動加速度波形から N 層骨組の最大
//! 層間変形角を予測する物理情報サロゲートモデルを学習するプログラムです。
//!
//! `clap` クレートを利用して、コマンドラインから `generate`（合成データ
//! 生成）、`train`（学習）、`evaluate`（評価）を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 合成キャンペーンの生成
//! ```bash
//! cargo run --release -- generate --n-stories 3 --n-records 20
//! ```
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --n-stories 3
//! ```
//!
//! ### 評価
//! ```bash
//! cargo run --release -- evaluate --n-stories 3
//! ```

use clap::Parser;
use drift_pinn::cli::{Cli, Commands, StructureArgs};
use drift_pinn::config::ExperimentConfig;
use drift_pinn::dataset::DatasetBuilder;
use drift_pinn::error::Result;
use drift_pinn::evaluate::{EvalBackend, EvaluationReporter, write_report};
use drift_pinn::geometry::{GeometryDescriptor, StoryParam};
use drift_pinn::ingest::{IngestOutcome, SimulationRecordIngestor};
use drift_pinn::training::{TrainOutcome, Trainer};
use drift_pinn::{METRICS_FILENAME, checkpoint, simulate};
use std::path::Path;

fn geometry_of(args: &StructureArgs) -> Result<GeometryDescriptor> {
    GeometryDescriptor::new(
        args.n_stories,
        StoryParam::Uniform(args.story_mass),
        StoryParam::Uniform(args.story_stiffness),
        args.rayleigh_alpha,
        args.rayleigh_beta,
        args.story_height,
    )
}

/// 取り込み結果の集約報告。失敗があっても処理は続行します。
fn report_ingest(outcome: &IngestOutcome) {
    println!(
        "=> {} 記録を取り込みました（失敗 {} 件）。",
        outcome.samples.len(),
        outcome.failures.len()
    );
    for failure in &outcome.failures {
        eprintln!("  取り込み失敗 {}: {}", failure.path.display(), failure.error);
    }
}

fn run_generate(
    structure: &StructureArgs,
    out_dir: &Path,
    n_records: usize,
    n_steps: usize,
    dt: f64,
    seed: u64,
) -> Result<()> {
    let geometry = geometry_of(structure)?;
    println!(
        "合成キャンペーンを生成します (N={}, {} 記録, Δt={} s)",
        geometry.n_stories(),
        n_records,
        dt
    );
    let paths = simulate::generate_campaign(out_dir, &geometry, n_records, n_steps, dt, seed)?;
    println!("=> {} 記録を '{}' に保存しました。", paths.len(), out_dir.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_train(
    structure: &StructureArgs,
    data_dir: &Path,
    artifacts_dir: &Path,
    lambda: f64,
    max_epochs: usize,
    patience: usize,
    seed: u64,
    window_len: usize,
) -> Result<()> {
    let geometry = geometry_of(structure)?;
    let config = ExperimentConfig {
        lambda_physics: lambda,
        max_epochs,
        patience,
        seed,
        window_len,
        story_height: structure.story_height,
        ..ExperimentConfig::for_stories(structure.n_stories)
    };
    config.validate()?;

    let ingestor = SimulationRecordIngestor::new(geometry.clone(), data_dir);
    let outcome = ingestor.ingest_all()?;
    report_ingest(&outcome);

    let dataset = DatasetBuilder::new(config.clone()).build(&outcome.samples)?;
    println!(
        "=> データセット: 学習 {} / 検証 {} / テスト {} サンプル",
        dataset.train.len(),
        dataset.val.len(),
        dataset.test.len()
    );

    let trainer = Trainer::new(config, geometry, artifacts_dir)?;
    let report = trainer.run(&dataset)?;
    match report.outcome {
        TrainOutcome::Converged { epoch } => {
            println!("=> epoch {epoch} で早期終了（収束）しました。")
        }
        TrainOutcome::MaxEpochsReached => println!("=> 最大エポックまで学習しました。"),
        TrainOutcome::Cancelled { epoch } => println!("=> epoch {epoch} で中断されました。"),
    }
    println!(
        "=> チェックポイントを '{}' に保存しました。",
        artifacts_dir.display()
    );
    Ok(())
}

fn run_evaluate(
    structure: &StructureArgs,
    data_dir: &Path,
    artifacts_dir: &Path,
    seed: u64,
    window_len: usize,
    latency_iters: usize,
) -> Result<()> {
    let geometry = geometry_of(structure)?;
    let config = ExperimentConfig {
        seed,
        window_len,
        story_height: structure.story_height,
        ..ExperimentConfig::for_stories(structure.n_stories)
    };
    config.validate()?;

    let ingestor = SimulationRecordIngestor::new(geometry.clone(), data_dir);
    let outcome = ingestor.ingest_all()?;
    report_ingest(&outcome);
    let dataset = DatasetBuilder::new(config).build(&outcome.samples)?;

    println!("保存済みモデルを '{}' からロード中...", artifacts_dir.display());
    let device = Default::default();
    let (model, meta) =
        checkpoint::load_checkpoint::<EvalBackend>(artifacts_dir, &geometry, &device)?;
    println!(
        "=> epoch {} のチェックポイント (検証損失 {:.6}) を読み込みました。",
        meta.epoch, meta.validation_loss
    );

    let reporter = EvaluationReporter::new(&model);
    let report = reporter.evaluate(&dataset.test, latency_iters)?;

    println!(
        "評価が完了しました。テスト {} サンプル, R²={:.4}, RMSE(最大ドリフト比)={:.4}, MAE={:.6}",
        report.n_test_examples, report.overall.r2, report.overall.rmse_fraction, report.overall.mae
    );
    for story in &report.per_story {
        println!(
            "  {}階: R²={:.4}, RMSE={:.4}, MAE={:.6}",
            story.story, story.metrics.r2, story.metrics.rmse_fraction, story.metrics.mae
        );
    }
    println!(
        "  レイテンシ: 平均 {:.3} ms, p99 {:.3} ms, {:.1} 回/s",
        report.latency.mean_ms, report.latency.p99_ms, report.latency.throughput_per_sec
    );

    let metrics_path = artifacts_dir.join(METRICS_FILENAME);
    write_report(&report, &metrics_path)?;
    println!("=> 評価レポートを '{}' に保存しました。", metrics_path.display());
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Generate {
            structure,
            out_dir,
            n_records,
            n_steps,
            dt,
            seed,
        } => run_generate(structure, out_dir, *n_records, *n_steps, *dt, *seed),
        Commands::Train {
            structure,
            data_dir,
            artifacts_dir,
            lambda,
            max_epochs,
            patience,
            seed,
            window_len,
        } => run_train(
            structure,
            data_dir,
            artifacts_dir,
            *lambda,
            *max_epochs,
            *patience,
            *seed,
            *window_len,
        ),
        Commands::Evaluate {
            structure,
            data_dir,
            artifacts_dir,
            seed,
            window_len,
            latency_iters,
        } => run_evaluate(
            structure,
            data_dir,
            artifacts_dir,
            *seed,
            *window_len,
            *latency_iters,
        ),
    }
}

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、各サブコマンドの処理に振り分けます。
fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("エラー: {e}");
        std::process::exit(1);
    }
}
