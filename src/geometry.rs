//! N層せん断型骨組の構造諸元。
//!
//! `GeometryDescriptor` は階数 N の唯一の情報源であり、質量行列 M・剛性行列 K・
//! Rayleigh 減衰行列 C = αM + βK をここから決定論的に導出します。
//! 行列は呼び出しのたびに N から再計算され、既定サイズの行列をキャッシュして
//! 流用することはありません（N=3 を要求したのに N=5 の既定モデルが黙って
//! 使われる、という種類の欠陥を構造的に防ぐため）。

use crate::error::{PinnError, Result};
use serde::{Deserialize, Serialize};

/// 階ごとのパラメータ指定。
///
/// スカラーは全階に同じ値をブロードキャストし、列は長さ N が要求されます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoryParam {
    /// 全階一様
    Uniform(f64),
    /// 階ごとに指定（長さ N）
    PerStory(Vec<f64>),
}

impl StoryParam {
    fn broadcast(&self, n: usize, name: &str) -> Result<Vec<f64>> {
        match self {
            StoryParam::Uniform(v) => Ok(vec![*v; n]),
            StoryParam::PerStory(vs) => {
                if vs.len() != n {
                    return Err(PinnError::Configuration(format!(
                        "{name} の長さ {} が階数 N={n} と一致しません",
                        vs.len()
                    )));
                }
                Ok(vs.clone())
            }
        }
    }
}

/// N層構造の不変な幾何・力学記述子。
///
/// 質量は集中質量（対角 M）、剛性はせん断型（三重対角 K）、減衰は
/// Rayleigh 型 C = αM + βK を仮定します。行列はすべて行優先の平坦な
/// `Vec<f64>`（長さ N×N）として返します。
#[derive(Debug, Clone)]
pub struct GeometryDescriptor {
    n_stories: usize,
    masses: Vec<f64>,
    stiffnesses: Vec<f64>,
    rayleigh_alpha: f64,
    rayleigh_beta: f64,
    story_height: f64,
}

impl GeometryDescriptor {
    /// 記述子を構築します。
    ///
    /// N ≤ 0、列長の不一致、非正の質量・剛性は `ConfigurationError` です。
    pub fn new(
        n_stories: usize,
        masses: StoryParam,
        stiffnesses: StoryParam,
        rayleigh_alpha: f64,
        rayleigh_beta: f64,
        story_height: f64,
    ) -> Result<Self> {
        if n_stories == 0 {
            return Err(PinnError::Configuration(
                "n_stories は 1 以上が必要です".into(),
            ));
        }
        let masses = masses.broadcast(n_stories, "masses")?;
        let stiffnesses = stiffnesses.broadcast(n_stories, "stiffnesses")?;
        if masses.iter().any(|&m| m <= 0.0) {
            return Err(PinnError::Configuration("質量は正の値が必要です".into()));
        }
        if stiffnesses.iter().any(|&k| k <= 0.0) {
            return Err(PinnError::Configuration("剛性は正の値が必要です".into()));
        }
        if rayleigh_alpha < 0.0 || rayleigh_beta < 0.0 {
            return Err(PinnError::Configuration(
                "Rayleigh 係数 α, β は非負が必要です".into(),
            ));
        }
        if story_height <= 0.0 {
            return Err(PinnError::Configuration(
                "story_height は正の値が必要です".into(),
            ));
        }
        Ok(Self {
            n_stories,
            masses,
            stiffnesses,
            rayleigh_alpha,
            rayleigh_beta,
            story_height,
        })
    }

    /// 階数 N
    pub fn n_stories(&self) -> usize {
        self.n_stories
    }

    /// 階高 [m]
    pub fn story_height(&self) -> f64 {
        self.story_height
    }

    /// 階質量（長さ N）
    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    /// 質量行列 M（対角、N×N 行優先）
    pub fn mass_matrix(&self) -> Vec<f64> {
        let n = self.n_stories;
        let mut m = vec![0.0; n * n];
        for i in 0..n {
            m[i * n + i] = self.masses[i];
        }
        m
    }

    /// 剛性行列 K（せん断型三重対角、N×N 行優先）。
    ///
    /// 第 i 階の層剛性を k_i として
    /// K[i][i] = k_i + k_{i+1}（最上階は k_N のみ）、K[i][i±1] = -k_{i±1}。
    pub fn stiffness_matrix(&self) -> Vec<f64> {
        let n = self.n_stories;
        let k = &self.stiffnesses;
        let mut mat = vec![0.0; n * n];
        for i in 0..n {
            let upper = if i + 1 < n { k[i + 1] } else { 0.0 };
            mat[i * n + i] = k[i] + upper;
            if i + 1 < n {
                mat[i * n + (i + 1)] = -k[i + 1];
                mat[(i + 1) * n + i] = -k[i + 1];
            }
        }
        mat
    }

    /// 減衰行列 C = αM + βK（N×N 行優先）
    pub fn damping_matrix(&self) -> Vec<f64> {
        let m = self.mass_matrix();
        let k = self.stiffness_matrix();
        m.iter()
            .zip(k.iter())
            .map(|(mi, ki)| self.rayleigh_alpha * mi + self.rayleigh_beta * ki)
            .collect()
    }

    /// 一次固有周期 T₁ = 2π/ω₁ [s]。
    ///
    /// 三重対角な K を利用した逆反復で最小固有対を求め、Rayleigh 商から
    /// ω₁² を得ます。K は正定値なのでピボット選択は不要です。
    pub fn fundamental_period(&self) -> f64 {
        let n = self.n_stories;
        let mut v = vec![1.0_f64; n];
        for _ in 0..60 {
            let rhs: Vec<f64> = (0..n).map(|i| self.masses[i] * v[i]).collect();
            let u = self.solve_tridiagonal(&rhs);
            let norm = u.iter().fold(0.0_f64, |m, &x| m.max(x.abs()));
            v = u.iter().map(|&x| x / norm).collect();
        }
        let k = self.stiffness_matrix();
        let kv: Vec<f64> = (0..n)
            .map(|i| (0..n).map(|j| k[i * n + j] * v[j]).sum())
            .collect();
        let num: f64 = v.iter().zip(kv.iter()).map(|(a, b)| a * b).sum();
        let den: f64 = v
            .iter()
            .zip(self.masses.iter())
            .map(|(a, m)| a * a * m)
            .sum();
        2.0 * std::f64::consts::PI / (num / den).sqrt()
    }

    /// K x = rhs をトーマス法で解きます（K はせん断型三重対角）。
    fn solve_tridiagonal(&self, rhs: &[f64]) -> Vec<f64> {
        let n = self.n_stories;
        let k = &self.stiffnesses;
        let mut diag: Vec<f64> = (0..n)
            .map(|i| k[i] + if i + 1 < n { k[i + 1] } else { 0.0 })
            .collect();
        let off: Vec<f64> = (1..n).map(|i| -k[i]).collect();
        let mut b = rhs.to_vec();
        for i in 1..n {
            let w = off[i - 1] / diag[i - 1];
            diag[i] -= w * off[i - 1];
            b[i] -= w * b[i - 1];
        }
        let mut x = vec![0.0; n];
        x[n - 1] = b[n - 1] / diag[n - 1];
        for i in (0..n - 1).rev() {
            x[i] = (b[i] - off[i] * x[i + 1]) / diag[i];
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(n: usize) -> GeometryDescriptor {
        GeometryDescriptor::new(
            n,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(1.0),
            0.02,
            0.01,
            3.0,
        )
        .unwrap()
    }

    fn assert_symmetric(mat: &[f64], n: usize) {
        assert_eq!(mat.len(), n * n);
        for i in 0..n {
            for j in 0..n {
                assert_eq!(mat[i * n + j], mat[j * n + i]);
            }
        }
    }

    #[test]
    fn matrices_are_square_and_symmetric_for_n3_and_n5_in_same_process() {
        // 同一プロセス内で別の N を並行に扱っても形状が混ざらないこと
        let g3 = uniform(3);
        let g5 = uniform(5);
        for (g, n) in [(&g3, 3), (&g5, 5)] {
            assert_symmetric(&g.mass_matrix(), n);
            assert_symmetric(&g.stiffness_matrix(), n);
            assert_symmetric(&g.damping_matrix(), n);
        }
        assert_eq!(g3.stiffness_matrix().len(), 9);
        assert_eq!(g5.stiffness_matrix().len(), 25);
    }

    #[test]
    fn single_story_descriptor_is_valid() {
        let g = uniform(1);
        assert_eq!(g.mass_matrix(), vec![1.0]);
        assert_eq!(g.stiffness_matrix(), vec![1.0]);
    }

    #[test]
    fn shear_building_stiffness_values() {
        let g = GeometryDescriptor::new(
            3,
            StoryParam::Uniform(2.0),
            StoryParam::PerStory(vec![3.0, 2.0, 1.0]),
            0.0,
            0.0,
            3.0,
        )
        .unwrap();
        let k = g.stiffness_matrix();
        // [[5, -2, 0], [-2, 3, -1], [0, -1, 1]]
        assert_eq!(k, vec![5.0, -2.0, 0.0, -2.0, 3.0, -1.0, 0.0, -1.0, 1.0]);
    }

    #[test]
    fn damping_is_rayleigh_combination() {
        let g = GeometryDescriptor::new(
            2,
            StoryParam::Uniform(2.0),
            StoryParam::Uniform(4.0),
            0.5,
            0.25,
            3.0,
        )
        .unwrap();
        let c = g.damping_matrix();
        let m = g.mass_matrix();
        let k = g.stiffness_matrix();
        for i in 0..4 {
            assert!((c[i] - (0.5 * m[i] + 0.25 * k[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn single_story_fundamental_period_is_exact() {
        // T = 2π √(m/k)
        let g = GeometryDescriptor::new(
            1,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(100.0),
            0.0,
            0.0,
            3.0,
        )
        .unwrap();
        let expected = 2.0 * std::f64::consts::PI / 10.0;
        assert!((g.fundamental_period() - expected).abs() < 1e-9);
    }

    #[test]
    fn two_story_fundamental_period_matches_eigenvalue() {
        // m=1, k=1 の2層: ω₁² = (3 − √5)/2
        let g = uniform(2);
        let omega2 = (3.0 - 5.0_f64.sqrt()) / 2.0;
        let expected = 2.0 * std::f64::consts::PI / omega2.sqrt();
        assert!((g.fundamental_period() - expected).abs() < 1e-6);
    }

    #[test]
    fn rejects_zero_stories_and_length_mismatch() {
        assert!(
            GeometryDescriptor::new(
                0,
                StoryParam::Uniform(1.0),
                StoryParam::Uniform(1.0),
                0.0,
                0.0,
                3.0
            )
            .is_err()
        );
        let err = GeometryDescriptor::new(
            4,
            StoryParam::PerStory(vec![1.0, 1.0, 1.0]),
            StoryParam::Uniform(1.0),
            0.0,
            0.0,
            3.0,
        );
        assert!(matches!(err, Err(PinnError::Configuration(_))));
    }
}
