//! 生シミュレーション記録の取り込み。
//!
//! ディレクトリ内の応答記録ファイルを読み、変位・速度・加速度・地動加速度の
//! 揃ったテンソル（`SimulationSample`）の列に変換します。対応形式は2種類:
//!
//! - 合成形式: 本クレートの `generate` が書き出す CSV。先頭に `# key=value`
//!   のメタデータ行（record_id, dt など）を持ち、列は `disp_i / vel_i / acc_i`。
//! - 外部形式: 先頭がヘッダ行の素の CSV。列は `t, ag, u1..uN, v1..vN, a1..aN`
//!   （大文字小文字は無視）。Δt は time 列から推定し、無ければファイル名中の
//!   `dt<値>` から読み取ります。
//!
//! 形式は先頭行で自動判別します。1ファイルの失敗は他のファイルの取り込みを
//! 止めず、`IngestOutcome::failures` に集約されます。推定された階数が
//! 記述子の N と食い違う場合は黙って整形せず、必ずエラーにします。
//!
//! 取り込み時には強度指標（PGA・PGV・Arias 強度・Sa(T₁)）を波形から計算して
//! 記録に付与し、物理的妥当性の境界（`IngestLimits`: 最大層間変形角・最大
//! PGA・最小継続時間）を検査します。境界を外れた記録はデータセットに入れず
//! `failures` へ回します。

use crate::error::{PinnError, Result};
use crate::geometry::GeometryDescriptor;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

/// 重力加速度 [m/s²]
const GRAVITY: f64 = 9.80665;

/// Sa 計算に使う SDOF の減衰比
const SA_DAMPING: f64 = 0.05;

/// 記録の出所タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// 内部生成の合成地震動
    Synthetic,
    /// 外部由来の実記録
    Real,
}

/// 1本の地震動記録（取り込み後は不変）
#[derive(Debug, Clone)]
pub struct GroundMotionRecord {
    /// レコード識別子
    pub id: String,
    /// サンプリング間隔 Δt [s]
    pub dt: f32,
    /// 出所
    pub source: RecordSource,
    /// 地動加速度時刻歴 ü_g(t) [m/s²]
    pub accel: Vec<f32>,
    /// 最大地動加速度 |ü_g| の最大値 [m/s²]
    pub pga: f32,
    /// 最大地動速度 [m/s]
    pub pgv: f32,
    /// Arias 強度 [m/s]
    pub arias: f32,
    /// 一次固有周期に対する擬似加速度応答 Sa(T₁) [m/s²]
    pub sa_t1: f32,
    /// 継続時間 [s]
    pub duration: f32,
}

impl GroundMotionRecord {
    /// 波形から強度指標一式を計算し直して返します。
    ///
    /// Sa は周期 `t1`・減衰比 5% の SDOF に対する擬似加速度応答です。
    pub fn with_intensity(mut self, t1: f64) -> Self {
        self.pga = self.accel.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
        self.pgv = compute_pgv(&self.accel, self.dt);
        self.arias = compute_arias(&self.accel, self.dt);
        self.sa_t1 = compute_spectral_acceleration(&self.accel, self.dt, t1, SA_DAMPING);
        self
    }
}

/// 最大地動速度。加速度を台形則で積分した速度の絶対値最大です。
pub fn compute_pgv(accel: &[f32], dt: f32) -> f32 {
    let mut v = 0.0_f64;
    let mut peak = 0.0_f64;
    for w in accel.windows(2) {
        v += 0.5 * (w[0] as f64 + w[1] as f64) * dt as f64;
        peak = peak.max(v.abs());
    }
    peak as f32
}

/// Arias 強度 Ia = π/(2g) ∫ ü_g² dt
pub fn compute_arias(accel: &[f32], dt: f32) -> f32 {
    let sum: f64 = accel.iter().map(|&a| (a as f64).powi(2)).sum();
    (PI / (2.0 * GRAVITY) * sum * dt as f64) as f32
}

/// 擬似加速度応答 Sa(T) = ω² · max|u|。
///
/// 周期 T・減衰比 ζ の SDOF を Newmark-β（平均加速度法）で積分します。
/// T ≤ 0 や 2 点未満の波形には 0 を返します。
pub fn compute_spectral_acceleration(accel: &[f32], dt: f32, period: f64, zeta: f64) -> f32 {
    if period <= 0.0 || accel.len() < 2 {
        return 0.0;
    }
    let dt = dt as f64;
    let omega = 2.0 * PI / period;
    let k = omega * omega;
    let c = 2.0 * zeta * omega;
    const GAMMA: f64 = 0.5;
    const BETA: f64 = 0.25;
    let a0 = 1.0 / (BETA * dt * dt);
    let a1 = GAMMA / (BETA * dt);
    let a2 = 1.0 / (BETA * dt);
    let a3 = 1.0 / (2.0 * BETA) - 1.0;
    let a4 = GAMMA / BETA - 1.0;
    let a5 = dt * (GAMMA / (2.0 * BETA) - 1.0);
    let k_eff = k + a1 * c + a0;

    let mut u = 0.0_f64;
    let mut v = 0.0_f64;
    let mut a = -(accel[0] as f64);
    let mut peak = 0.0_f64;
    for &ag in &accel[1..] {
        let p = -(ag as f64) + (a0 * u + a2 * v + a3 * a) + c * (a1 * u + a4 * v + a5 * a);
        let u_next = p / k_eff;
        let a_next = a0 * (u_next - u) - a2 * v - a3 * a;
        v += dt * ((1.0 - GAMMA) * a + GAMMA * a_next);
        u = u_next;
        a = a_next;
        peak = peak.max(u.abs());
    }
    (k * peak) as f32
}

/// 取り込み時の物理的妥当性の境界。
///
/// いずれかを外れた記録は `IngestOutcome::failures` に回され、データセット
/// には入りません。
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    /// 層間変形角の上限
    pub max_drift: f32,
    /// PGA の上限 [m/s²]
    pub max_pga: f32,
    /// 記録の最小継続時間 [s]
    pub min_duration: f32,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_drift: 0.10,
            max_pga: (5.0 * GRAVITY) as f32,
            min_duration: 1.0,
        }
    }
}

/// (記録, 構造応答) の組。各応答は [N][T] の形。
#[derive(Debug, Clone)]
pub struct SimulationSample {
    /// 入力地震動
    pub record: GroundMotionRecord,
    /// 各階の変位 u(t)
    pub disp: Vec<Vec<f32>>,
    /// 各階の速度 u̇(t)
    pub vel: Vec<Vec<f32>>,
    /// 各階の加速度 ü(t)
    pub acc: Vec<Vec<f32>>,
}

impl SimulationSample {
    /// 応答の階数
    pub fn n_stories(&self) -> usize {
        self.disp.len()
    }

    /// 時間サンプル数 T
    pub fn n_steps(&self) -> usize {
        self.record.accel.len()
    }

    /// 各階の最大層間変形角（変位差 / 階高 の絶対値の時刻歴最大）。
    pub fn peak_drift(&self, story_height: f64) -> Vec<f32> {
        let n = self.n_stories();
        let t = self.n_steps();
        let h = story_height as f32;
        (0..n)
            .map(|i| {
                (0..t)
                    .map(|j| {
                        let below = if i == 0 { 0.0 } else { self.disp[i - 1][j] };
                        ((self.disp[i][j] - below) / h).abs()
                    })
                    .fold(0.0_f32, f32::max)
            })
            .collect()
    }
}

/// 取り込み結果。成功サンプルと記録単位の失敗を分けて保持します。
#[derive(Debug)]
pub struct IngestOutcome {
    /// 取り込めたサンプル（1ソース内ではファイル名順で安定）
    pub samples: Vec<SimulationSample>,
    /// 記録単位の失敗（集約報告用）
    pub failures: Vec<IngestFailure>,
}

/// 1記録の取り込み失敗
#[derive(Debug)]
pub struct IngestFailure {
    /// 対象ファイル
    pub path: PathBuf,
    /// 原因
    pub error: PinnError,
}

/// 生応答ファイルのディレクトリを `SimulationSample` 列へ変換する取り込み器。
#[derive(Debug, Clone)]
pub struct SimulationRecordIngestor {
    geometry: GeometryDescriptor,
    dir: PathBuf,
    limits: IngestLimits,
}

impl SimulationRecordIngestor {
    /// 取り込み器を作成します。階数の検証には `geometry` の N を使います。
    pub fn new(geometry: GeometryDescriptor, dir: impl Into<PathBuf>) -> Self {
        Self {
            geometry,
            dir: dir.into(),
            limits: IngestLimits::default(),
        }
    }

    /// 妥当性境界を差し替えます。
    pub fn with_limits(mut self, limits: IngestLimits) -> Self {
        self.limits = limits;
        self
    }

    /// 対象となる CSV ファイル一覧（ファイル名順）。
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// 遅延評価の取り込みイテレータ。呼ぶたびに先頭から走査し直せます。
    pub fn iter(
        &self,
    ) -> Result<impl Iterator<Item = std::result::Result<SimulationSample, IngestFailure>> + '_>
    {
        let files = self.files()?;
        let limits = self.limits;
        Ok(files.into_iter().map(move |path| {
            parse_record_file(&path, &self.geometry)
                .and_then(|sample| {
                    validate_sample(&path, &sample, &self.geometry, limits)?;
                    Ok(sample)
                })
                .map_err(|error| IngestFailure {
                    path: path.clone(),
                    error,
                })
        }))
    }

    /// ディレクトリ全体を1パスで取り込み、成功と失敗を集約して返します。
    pub fn ingest_all(&self) -> Result<IngestOutcome> {
        let mut samples = Vec::new();
        let mut failures = Vec::new();
        for item in self.iter()? {
            match item {
                Ok(sample) => samples.push(sample),
                Err(failure) => failures.push(failure),
            }
        }
        Ok(IngestOutcome { samples, failures })
    }
}

fn record_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn ingest_err(path: &Path, reason: impl Into<String>) -> PinnError {
    PinnError::Ingest {
        record_id: record_id_of(path),
        reason: reason.into(),
    }
}

/// 1ファイルを読み、形式を自動判別してサンプルへ変換します。
pub fn parse_record_file(path: &Path, geometry: &GeometryDescriptor) -> Result<SimulationSample> {
    let text = fs::read_to_string(path)
        .map_err(|e| ingest_err(path, format!("読み込み失敗: {e}")))?;
    let first = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ingest_err(path, "ファイルが空です"))?;
    if first.trim_start().starts_with('#') {
        parse_synthetic(path, &text, geometry)
    } else {
        parse_external(path, &text, geometry)
    }
}

/// 列名 → 列番号の表を作ります（小文字化・trim 済み）。
fn header_map(header: &str) -> HashMap<String, usize> {
    header
        .split(',')
        .enumerate()
        .map(|(i, name)| (name.trim().to_ascii_lowercase(), i))
        .collect()
}

/// `prefix1, prefix2, ...` と連番で並ぶ列の本数を数えます。
fn count_numbered(cols: &HashMap<String, usize>, prefix: &str) -> usize {
    let mut n = 0;
    while cols.contains_key(&format!("{prefix}{}", n + 1)) {
        n += 1;
    }
    n
}

fn parse_rows(path: &Path, lines: &[&str], n_cols: usize) -> Result<Vec<Vec<f32>>> {
    let mut rows = Vec::with_capacity(lines.len());
    for (lineno, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != n_cols {
            return Err(ingest_err(
                path,
                format!(
                    "{}行目の列数 {} がヘッダの列数 {} と一致しません",
                    lineno + 1,
                    fields.len(),
                    n_cols
                ),
            ));
        }
        let mut row = Vec::with_capacity(n_cols);
        for f in fields {
            let v: f32 = f.trim().parse().map_err(|_| {
                ingest_err(path, format!("{}行目の数値 '{}' を解釈できません", lineno + 1, f))
            })?;
            if !v.is_finite() {
                return Err(ingest_err(
                    path,
                    format!("{}行目に非有限値が含まれます", lineno + 1),
                ));
            }
            row.push(v);
        }
        rows.push(row);
    }
    if rows.len() < 2 {
        return Err(ingest_err(path, "データ行が2行未満です"));
    }
    Ok(rows)
}

fn column(rows: &[Vec<f32>], idx: usize) -> Vec<f32> {
    rows.iter().map(|r| r[idx]).collect()
}

fn build_sample(
    path: &Path,
    geometry: &GeometryDescriptor,
    source: RecordSource,
    id: String,
    dt: f32,
    rows: &[Vec<f32>],
    ag_idx: usize,
    disp_idx: &[usize],
    vel_idx: &[usize],
    acc_idx: &[usize],
) -> Result<SimulationSample> {
    let found = disp_idx.len();
    if found != vel_idx.len() || found != acc_idx.len() {
        return Err(ingest_err(
            path,
            format!(
                "変位/速度/加速度の列数が揃っていません (disp={}, vel={}, acc={})",
                disp_idx.len(),
                vel_idx.len(),
                acc_idx.len()
            ),
        ));
    }
    if found == 0 {
        return Err(ingest_err(path, "応答列（変位/速度/加速度）が見つかりません"));
    }
    if found != geometry.n_stories() {
        // 階数の食い違いは整形せずエラーにする
        return Err(ingest_err(
            path,
            format!(
                "記録の階数 {found} が設定の N={} と一致しません",
                geometry.n_stories()
            ),
        ));
    }
    if !(dt.is_finite() && dt > 0.0) {
        return Err(ingest_err(path, format!("Δt が不正です ({dt})")));
    }
    let accel = column(rows, ag_idx);
    let duration = accel.len() as f32 * dt;
    let record = GroundMotionRecord {
        id,
        dt,
        source,
        pga: 0.0,
        pgv: 0.0,
        arias: 0.0,
        sa_t1: 0.0,
        duration,
        accel,
    }
    .with_intensity(geometry.fundamental_period());
    Ok(SimulationSample {
        record,
        disp: disp_idx.iter().map(|&i| column(rows, i)).collect(),
        vel: vel_idx.iter().map(|&i| column(rows, i)).collect(),
        acc: acc_idx.iter().map(|&i| column(rows, i)).collect(),
    })
}

/// 取り込んだサンプルを `IngestLimits` に照らして検査します。
fn validate_sample(
    path: &Path,
    sample: &SimulationSample,
    geometry: &GeometryDescriptor,
    limits: IngestLimits,
) -> Result<()> {
    let record = &sample.record;
    if record.duration < limits.min_duration {
        return Err(ingest_err(
            path,
            format!(
                "継続時間 {:.3} s が下限 {:.3} s を下回ります",
                record.duration, limits.min_duration
            ),
        ));
    }
    if record.pga > limits.max_pga {
        return Err(ingest_err(
            path,
            format!(
                "PGA {:.3} m/s² が上限 {:.3} m/s² を超えています",
                record.pga, limits.max_pga
            ),
        ));
    }
    let drift = sample.peak_drift(geometry.story_height());
    if let Some((story, &d)) = drift
        .iter()
        .enumerate()
        .find(|&(_, &d)| d > limits.max_drift)
    {
        return Err(ingest_err(
            path,
            format!(
                "{}階の層間変形角 {:.4} が上限 {:.4} を超えています",
                story + 1,
                d,
                limits.max_drift
            ),
        ));
    }
    Ok(())
}

fn parse_synthetic(
    path: &Path,
    text: &str,
    geometry: &GeometryDescriptor,
) -> Result<SimulationSample> {
    let mut meta = HashMap::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.peek() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix('#') {
            if let Some((key, value)) = rest.split_once('=') {
                meta.insert(key.trim().to_string(), value.trim().to_string());
            }
            lines.next();
        } else {
            break;
        }
    }
    let header = lines
        .next()
        .ok_or_else(|| ingest_err(path, "ヘッダ行がありません"))?;
    let cols = header_map(header);
    let data_lines: Vec<&str> = lines.collect();
    let rows = parse_rows(path, &data_lines, cols.len())?;

    let id = meta
        .get("record_id")
        .cloned()
        .unwrap_or_else(|| record_id_of(path));
    let dt: f32 = meta
        .get("dt")
        .ok_or_else(|| ingest_err(path, "メタデータに dt がありません"))?
        .parse()
        .map_err(|_| ingest_err(path, "メタデータの dt を解釈できません"))?;
    let ag_idx = *cols
        .get("ag")
        .ok_or_else(|| ingest_err(path, "必須列 'ag' がありません"))?;

    let family = |prefix: &str| -> Vec<usize> {
        (1..=count_numbered(&cols, prefix))
            .filter_map(|i| cols.get(&format!("{prefix}{i}")).copied())
            .collect()
    };
    let disp_idx = family("disp_");
    let vel_idx = family("vel_");
    let acc_idx = family("acc_");
    build_sample(
        path,
        geometry,
        RecordSource::Synthetic,
        id,
        dt,
        &rows,
        ag_idx,
        &disp_idx,
        &vel_idx,
        &acc_idx,
    )
}

fn dt_from_filename(path: &Path) -> Option<f32> {
    let stem = path.file_stem()?.to_string_lossy().to_ascii_lowercase();
    let pos = stem.rfind("dt")?;
    let tail = &stem[pos + 2..];
    let end = tail
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(tail.len());
    tail[..end].parse().ok()
}

fn parse_external(
    path: &Path,
    text: &str,
    geometry: &GeometryDescriptor,
) -> Result<SimulationSample> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| ingest_err(path, "ヘッダ行がありません"))?;
    let cols = header_map(header);
    let data_lines: Vec<&str> = lines.collect();
    let rows = parse_rows(path, &data_lines, cols.len())?;

    let ag_idx = cols
        .get("ag")
        .or_else(|| cols.get("ground_acc"))
        .or_else(|| cols.get("ground_accel"))
        .copied()
        .ok_or_else(|| ingest_err(path, "必須列 'ag' (ground_acc) がありません"))?;
    let time_idx = cols.get("t").or_else(|| cols.get("time")).copied();
    let dt = match time_idx {
        Some(ti) => rows[1][ti] - rows[0][ti],
        None => dt_from_filename(path).ok_or_else(|| {
            ingest_err(path, "time 列がなく、ファイル名からも Δt を推定できません")
        })?,
    };

    let n = count_numbered(&cols, "u");
    let family = |prefix: &str, count: usize| -> Vec<usize> {
        (1..=count)
            .filter_map(|i| cols.get(&format!("{prefix}{i}")).copied())
            .collect()
    };
    let disp_idx = family("u", n);
    let vel_idx = family("v", count_numbered(&cols, "v"));
    let acc_idx = family("a", count_numbered(&cols, "a"));
    build_sample(
        path,
        geometry,
        RecordSource::Real,
        record_id_of(path),
        dt,
        &rows,
        ag_idx,
        &disp_idx,
        &vel_idx,
        &acc_idx,
    )
}
