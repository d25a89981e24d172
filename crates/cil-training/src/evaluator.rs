//! Evaluation of the classifier head and of the nearest-mean-of-exemplars rule.
//!
//! The scoring functions work on plain rankings so they can be checked
//! without a model: a ranking is the list of class ids a classifier
//! proposes for one sample, best first.

use std::collections::BTreeMap;
use std::ops::Range;

use burn::tensor::{backend::Backend, Tensor};
use cil_core::{to_percent, AccuracyReport, Error, Result};
use cil_dataset::{DataSplit, SampleRef};
use tracing::debug;

use crate::model::IncrementalNet;

/// Largest `k` reported as "top5".
pub const TOP_K: usize = 5;

/// Key of a task range in the grouped report, e.g. `"00-09"`.
pub fn group_key(range: &Range<usize>) -> String {
    format!("{:02}-{:02}", range.start, range.end.saturating_sub(1))
}

/// Class ids ordered by decreasing score; ties keep the lower id first.
pub fn rank_by_score(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Class ids ordered by increasing Euclidean distance between `feature` and
/// each class mean. The feature is used as given.
pub fn nme_rank(means: &BTreeMap<usize, Vec<f32>>, feature: &[f32], k: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = means
        .iter()
        .map(|(&class, mean)| (class, squared_distance(mean, feature)))
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(k).map(|(class, _)| class).collect()
}

/// Top-1/top-5 accuracy plus the grouped breakdown.
///
/// Every sample is attributed to the task that introduced its *true* label.
/// `task_ranges` lists the class range of every task seen so far and
/// `known_classes` is the number of classes learned before the current task.
pub fn accuracy(
    rankings: &[Vec<usize>],
    targets: &[usize],
    task_ranges: &[Range<usize>],
    known_classes: usize,
) -> AccuracyReport {
    let mut correct_top1 = 0;
    let mut correct_topk = 0;
    let mut per_task = vec![(0usize, 0usize); task_ranges.len()];
    let mut old = (0usize, 0usize);
    let mut new = (0usize, 0usize);

    for (ranking, &target) in rankings.iter().zip(targets) {
        let hit = ranking.first() == Some(&target);
        if hit {
            correct_top1 += 1;
        }
        if ranking.iter().take(TOP_K).any(|&c| c == target) {
            correct_topk += 1;
        }

        if let Some(task) = task_ranges.iter().position(|r| r.contains(&target)) {
            per_task[task].1 += 1;
            if hit {
                per_task[task].0 += 1;
            }
        }
        let bucket = if target < known_classes { &mut old } else { &mut new };
        bucket.1 += 1;
        if hit {
            bucket.0 += 1;
        }
    }

    let total = rankings.len().min(targets.len());
    let mut grouped = BTreeMap::new();
    grouped.insert("total".to_string(), to_percent(correct_top1, total));
    for (range, &(hits, count)) in task_ranges.iter().zip(&per_task) {
        if count > 0 {
            grouped.insert(group_key(range), to_percent(hits, count));
        }
    }
    grouped.insert("old".to_string(), to_percent(old.0, old.1));
    grouped.insert("new".to_string(), to_percent(new.0, new.1));

    AccuracyReport {
        top1: to_percent(correct_top1, total),
        top5: to_percent(correct_topk, total),
        grouped,
        num_samples: total,
    }
}

fn rows(tensor: Tensor<impl Backend, 2>) -> Result<Vec<Vec<f32>>> {
    let [_, width] = tensor.dims();
    let values: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| Error::Model(format!("Failed to read tensor data: {:?}", e)))?;
    if width == 0 {
        return Ok(Vec::new());
    }
    Ok(values.chunks(width).map(<[f32]>::to_vec).collect())
}

/// Head rankings and true labels for every referenced sample.
pub fn cnn_rankings<B: Backend>(
    net: &IncrementalNet<B>,
    split: &DataSplit,
    refs: &[SampleRef],
    batch_size: usize,
    device: &B::Device,
) -> Result<(Vec<Vec<usize>>, Vec<usize>)> {
    let k = TOP_K.min(net.num_classes());
    let mut rankings = Vec::with_capacity(refs.len());
    for chunk in refs.chunks(batch_size.max(1)) {
        let batch = split.batch::<B>(chunk, device);
        let logits = net.forward(batch.inputs);
        rankings.extend(rows(logits)?.iter().map(|row| rank_by_score(row, k)));
    }
    let targets = refs.iter().map(|&r| split.label(r)).collect();
    debug!("Ranked {} samples with the classifier head", rankings.len());
    Ok((rankings, targets))
}

/// L2-normalised backbone features for every referenced sample.
pub fn extract_features<B: Backend>(
    net: &IncrementalNet<B>,
    split: &DataSplit,
    refs: &[SampleRef],
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<Vec<f32>>> {
    let mut features = Vec::with_capacity(refs.len());
    for chunk in refs.chunks(batch_size.max(1)) {
        let batch = split.batch::<B>(chunk, device);
        for mut row in rows(net.extract_vector(batch.inputs))? {
            l2_normalize(&mut row);
            features.push(row);
        }
    }
    Ok(features)
}

/// Nearest-mean rankings for already normalised features.
pub fn nme_rankings(features: &[Vec<f32>], means: &BTreeMap<usize, Vec<f32>>) -> Vec<Vec<usize>> {
    let k = TOP_K.min(means.len());
    features.iter().map(|f| nme_rank(means, f, k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_task_layout() -> Vec<Range<usize>> {
        vec![0..2, 2..4]
    }

    #[test]
    fn test_rank_by_score() {
        assert_eq!(rank_by_score(&[0.1, 0.7, 0.2], 2), vec![1, 2]);
        assert_eq!(rank_by_score(&[0.5, 0.5, 0.1], 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_nearest_mean_picks_closest_class() {
        let mut means = BTreeMap::new();
        means.insert(0, vec![0.0, 0.0]);
        means.insert(1, vec![10.0, 10.0]);
        assert_eq!(nme_rank(&means, &[1.0, 1.0], 1), vec![0]);
        assert_eq!(nme_rank(&means, &[9.0, 8.0], 2), vec![1, 0]);
    }

    #[test]
    fn test_nme_ignores_unrepresented_classes() {
        let mut means = BTreeMap::new();
        means.insert(0, vec![0.0, 0.0]);
        means.insert(2, vec![1.0, 0.0]);
        let rankings = nme_rankings(&[vec![0.9, 0.0]], &means);
        assert_eq!(rankings, vec![vec![2, 0]]);
    }

    #[test]
    fn test_grouping_follows_true_label() {
        // Two samples per class for classes 0, 1 and 3; the classifier always says 3.
        let targets = vec![0, 0, 1, 1, 3, 3];
        let rankings = vec![vec![3, 2, 1, 0]; targets.len()];
        let report = accuracy(&rankings, &targets, &two_task_layout(), 2);

        assert_eq!(report.group("00-01"), Some(0.0));
        assert_eq!(report.group("02-03"), Some(100.0));
        assert_eq!(report.group("old"), Some(0.0));
        assert_eq!(report.group("new"), Some(100.0));
        assert_eq!(report.top1, 33.33);
        assert_eq!(report.top5, 100.0);
    }

    #[test]
    fn test_top5_with_fewer_classes() {
        let targets = vec![1, 0];
        let rankings = vec![vec![0, 1], vec![1, 0]];
        let report = accuracy(&rankings, &targets, &[0..2], 0);
        assert_eq!(report.top1, 0.0);
        assert_eq!(report.top5, 100.0);
        assert_eq!(report.group("old"), Some(0.0));
        assert_eq!(report.group("00-01"), Some(0.0));
    }

    #[test]
    fn test_group_key_format() {
        assert_eq!(group_key(&(0..10)), "00-09");
        assert_eq!(group_key(&(50..60)), "50-59");
        assert_eq!(group_key(&(100..110)), "100-109");
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
