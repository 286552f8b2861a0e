use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::ScanConfig;
use crate::database::models::{Cluster, ClusterKind, Photo, Verdict};

/// Knobs of the suggestion pass, taken from the scan config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuggestionPolicy {
    pub keep_per_cluster: usize,
    pub exact_duplicates_keep_one: bool,
    pub singleton_delete_floor: Option<f64>,
}

impl From<&ScanConfig> for SuggestionPolicy {
    fn from(config: &ScanConfig) -> Self {
        Self {
            keep_per_cluster: config.keep_per_cluster,
            exact_duplicates_keep_one: config.exact_duplicates_keep_one,
            singleton_delete_floor: config.singleton_delete_floor,
        }
    }
}

impl SuggestionPolicy {
    fn keep_count(&self, kind: ClusterKind) -> usize {
        if kind == ClusterKind::ExactDuplicate && self.exact_duplicates_keep_one {
            1
        } else {
            self.keep_per_cluster.max(1)
        }
    }
}

/// Best first: higher score, then smaller path.
pub fn rank_order(a: &Photo, b: &Photo) -> Ordering {
    b.quality_score
        .total_cmp(&a.quality_score)
        .then_with(|| a.path.cmp(&b.path))
}

/// Suggest verdicts for one cluster. Only photos still in REVIEW receive a
/// suggestion; user decisions neither change nor use up keep slots.
pub fn suggest_cluster(
    cluster: &Cluster,
    members: &[&Photo],
    policy: &SuggestionPolicy,
) -> Vec<(String, Verdict)> {
    let mut ranked: Vec<&Photo> = members
        .iter()
        .copied()
        .filter(|photo| photo.verdict == Verdict::Review && !photo.user_override)
        .collect();
    ranked.sort_by(|a, b| rank_order(a, b));

    if cluster.kind == ClusterKind::Singleton || members.len() <= 1 {
        return ranked
            .into_iter()
            .map(|photo| {
                let verdict = match policy.singleton_delete_floor {
                    Some(floor) if photo.quality_score < floor => Verdict::Delete,
                    _ => Verdict::Keep,
                };
                (photo.path.clone(), verdict)
            })
            .collect();
    }

    let keep = policy.keep_count(cluster.kind);
    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, photo)| {
            let verdict = if rank < keep { Verdict::Keep } else { Verdict::Archive };
            (photo.path.clone(), verdict)
        })
        .collect()
}

/// Suggest verdicts for every cluster, ordered by cluster id then rank.
pub fn suggest_all(
    clusters: &[Cluster],
    photos: &[Photo],
    policy: &SuggestionPolicy,
) -> Vec<(String, Verdict)> {
    let by_path: HashMap<&str, &Photo> = photos.iter().map(|p| (p.path.as_str(), p)).collect();

    clusters
        .iter()
        .flat_map(|cluster| {
            let members: Vec<&Photo> = cluster
                .members
                .iter()
                .filter_map(|path| by_path.get(path.as_str()).copied())
                .collect();
            suggest_cluster(cluster, &members, policy)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(path: &str, score: f64) -> Photo {
        let mut photo = Photo::discovered(path.to_string(), path.to_string(), 1, 1);
        photo.quality_score = score;
        photo
    }

    fn cluster(kind: ClusterKind, members: &[&Photo]) -> Cluster {
        Cluster {
            id: 1,
            kind,
            members: members.iter().map(|p| p.path.clone()).collect(),
        }
    }

    fn policy(keep: usize) -> SuggestionPolicy {
        SuggestionPolicy {
            keep_per_cluster: keep,
            exact_duplicates_keep_one: true,
            singleton_delete_floor: None,
        }
    }

    #[test]
    fn test_top_k_kept_rest_archived() {
        let (a, b, c) = (photo("/a", 1.0), photo("/b", 3.0), photo("/c", 2.0));
        let members = [&a, &b, &c];
        let verdicts = suggest_cluster(&cluster(ClusterKind::NearDuplicate, &members), &members, &policy(2));

        assert_eq!(
            verdicts,
            vec![
                ("/b".to_string(), Verdict::Keep),
                ("/c".to_string(), Verdict::Keep),
                ("/a".to_string(), Verdict::Archive),
            ]
        );
    }

    #[test]
    fn test_ties_broken_by_path() {
        let (a, b) = (photo("/b", 1.0), photo("/a", 1.0));
        let members = [&a, &b];
        let verdicts = suggest_cluster(&cluster(ClusterKind::NearDuplicate, &members), &members, &policy(1));
        assert_eq!(verdicts[0], ("/a".to_string(), Verdict::Keep));
        assert_eq!(verdicts[1], ("/b".to_string(), Verdict::Archive));
    }

    #[test]
    fn test_exact_cluster_keeps_one() {
        let (a, b, c) = (photo("/a", 0.0), photo("/b", 0.0), photo("/c", 0.0));
        let members = [&a, &b, &c];
        let verdicts = suggest_cluster(&cluster(ClusterKind::ExactDuplicate, &members), &members, &policy(2));
        let kept = verdicts.iter().filter(|(_, v)| *v == Verdict::Keep).count();
        assert_eq!(kept, 1);

        let mut keep_all = policy(2);
        keep_all.exact_duplicates_keep_one = false;
        let verdicts = suggest_cluster(&cluster(ClusterKind::ExactDuplicate, &members), &members, &keep_all);
        assert_eq!(verdicts.iter().filter(|(_, v)| *v == Verdict::Keep).count(), 2);
    }

    #[test]
    fn test_user_overrides_untouched() {
        let a = photo("/a", 5.0);
        let mut b = photo("/b", 4.0);
        b.verdict = Verdict::Delete;
        b.user_override = true;
        let c = photo("/c", 1.0);
        let members = [&a, &b, &c];

        let verdicts = suggest_cluster(&cluster(ClusterKind::NearDuplicate, &members), &members, &policy(2));
        assert!(!verdicts.iter().any(|(p, _)| p == "/b"));
        assert_eq!(verdicts, vec![("/a".to_string(), Verdict::Keep), ("/c".to_string(), Verdict::Keep)]);
    }

    #[test]
    fn test_singletons_keep_unless_below_floor() {
        let low = photo("/low", 0.2);
        let high = photo("/high", 3.0);

        let verdicts = suggest_cluster(&cluster(ClusterKind::Singleton, &[&low]), &[&low], &policy(2));
        assert_eq!(verdicts, vec![("/low".to_string(), Verdict::Keep)]);

        let mut floor = policy(2);
        floor.singleton_delete_floor = Some(1.0);
        let verdicts = suggest_cluster(&cluster(ClusterKind::Singleton, &[&low]), &[&low], &floor);
        assert_eq!(verdicts, vec![("/low".to_string(), Verdict::Delete)]);
        let verdicts = suggest_cluster(&cluster(ClusterKind::Singleton, &[&high]), &[&high], &floor);
        assert_eq!(verdicts, vec![("/high".to_string(), Verdict::Keep)]);
    }

    #[test]
    fn test_suggest_all_walks_clusters() {
        let photos = vec![photo("/a", 1.0), photo("/b", 2.0), photo("/c", 1.0)];
        let clusters = vec![
            Cluster {
                id: 1,
                kind: ClusterKind::NearDuplicate,
                members: vec!["/a".to_string(), "/b".to_string()],
            },
            Cluster {
                id: 2,
                kind: ClusterKind::Singleton,
                members: vec!["/c".to_string()],
            },
        ];
        let verdicts = suggest_all(&clusters, &photos, &policy(1));
        assert_eq!(
            verdicts,
            vec![
                ("/b".to_string(), Verdict::Keep),
                ("/a".to_string(), Verdict::Archive),
                ("/c".to_string(), Verdict::Keep),
            ]
        );
    }
}
