//! 合成キャンペーン一式を使ったエンドツーエンドの学習・評価シナリオ。

use drift_pinn::checkpoint;
use drift_pinn::config::ExperimentConfig;
use drift_pinn::dataset::DatasetBuilder;
use drift_pinn::evaluate::{EvalBackend, EvaluationReporter};
use drift_pinn::geometry::{GeometryDescriptor, StoryParam};
use drift_pinn::ingest::SimulationRecordIngestor;
use drift_pinn::simulate;
use drift_pinn::training::{TrainOutcome, Trainer};
use std::collections::HashSet;

/// N=3, 20 記録, 14/3/3 分割, patience 50 のフルシナリオ。
/// 早期終了・有限で頭打ちになる検証損失・テスト R² > 0 を確認します。
#[test]
fn three_story_campaign_trains_early_stops_and_generalizes() {
    let geometry = GeometryDescriptor::new(
        3,
        StoryParam::Uniform(1.0),
        StoryParam::Uniform(100.0),
        0.05,
        0.002,
        3.0,
    )
    .unwrap();
    let config = ExperimentConfig {
        n_stories: 3,
        lambda_physics: 0.1,
        learning_rate: 3e-3,
        max_epochs: 500,
        patience: 50,
        train_ratio: 0.70,
        val_ratio: 0.15,
        test_ratio: 0.15,
        seed: 42,
        window_len: 32,
        window_stride: 32,
        batch_size: 32,
        hidden_size: 16,
        story_height: 3.0,
    };

    // --- 合成キャンペーンの生成と取り込み ---
    let data_dir = tempfile::tempdir().unwrap();
    let paths = simulate::generate_campaign(data_dir.path(), &geometry, 20, 400, 0.02, 42).unwrap();
    assert_eq!(paths.len(), 20);

    let ingestor = SimulationRecordIngestor::new(geometry.clone(), data_dir.path());
    let outcome = ingestor.ingest_all().unwrap();
    assert_eq!(outcome.samples.len(), 20);
    assert!(outcome.failures.is_empty());
    // 取り込み時に強度指標が付与され、妥当性境界を通過している
    assert!(
        outcome
            .samples
            .iter()
            .all(|s| s.record.pgv > 0.0 && s.record.arias > 0.0 && s.record.sa_t1 > 0.0)
    );

    // --- データセット構築: レコード単位で 14/3/3 ---
    let dataset = DatasetBuilder::new(config.clone())
        .build(&outcome.samples)
        .unwrap();
    let record_ids = |examples: &[drift_pinn::dataset::TrainingExample]| -> HashSet<String> {
        examples.iter().map(|e| e.record_id.clone()).collect()
    };
    let train_ids = record_ids(&dataset.train);
    let val_ids = record_ids(&dataset.val);
    let test_ids = record_ids(&dataset.test);
    assert_eq!(train_ids.len(), 14);
    assert_eq!(val_ids.len(), 3);
    assert_eq!(test_ids.len(), 3);
    assert!(train_ids.is_disjoint(&val_ids));
    assert!(train_ids.is_disjoint(&test_ids));
    assert!(val_ids.is_disjoint(&test_ids));

    // --- 学習: 500 エポック以内に早期終了すること ---
    let artifacts_dir = tempfile::tempdir().unwrap();
    let trainer = Trainer::new(config.clone(), geometry.clone(), artifacts_dir.path()).unwrap();
    let report = trainer.run(&dataset).unwrap();

    assert!(
        matches!(report.outcome, TrainOutcome::Converged { .. }),
        "早期終了せず {} エポック走りました",
        report.history.len()
    );
    assert!(report.history.len() < 500);
    assert!(report.best_val_loss.is_finite());
    assert!(report.history.iter().all(|s| s.val_loss.is_finite()));

    // 検証損失は減少してから頭打ちになる（退化していない）
    let first_val = report.history.first().unwrap().val_loss;
    assert!(report.best_val_loss < first_val);

    // --- 評価: チェックポイントを読み戻してテスト R² > 0 ---
    let device = Default::default();
    let (model, meta) =
        checkpoint::load_checkpoint::<EvalBackend>(artifacts_dir.path(), &geometry, &device)
            .unwrap();
    assert_eq!(meta.n_stories, 3);
    assert_eq!(meta.epoch, report.best_epoch);

    let reporter = EvaluationReporter::new(&model);
    let metrics = reporter.evaluate(&dataset.test, 50).unwrap();
    assert_eq!(metrics.n_stories, 3);
    assert!(
        metrics.overall.r2 > 0.0,
        "テスト R² が健全性の下限を下回りました: {}",
        metrics.overall.r2
    );
    // 階別指標は順序を仮定せず、有限であることのみ確認する
    assert!(metrics.per_story.iter().all(|s| s.metrics.r2.is_finite()));
}
