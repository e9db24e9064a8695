// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pure detection filtering and relevance scoring. No I/O.

use crate::frame::Detection;
use base::FastHashSet;

#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    pub threshold: f32,

    /// Empty means "allow all".
    pub allowed_classes: FastHashSet<String>,
}

/// Keeps detections with `conf >= threshold` whose class is allowed.
pub fn filter(detections: &[Detection], config: &FilterConfig) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| {
            d.conf >= config.threshold
                && (config.allowed_classes.is_empty() || config.allowed_classes.contains(&d.cls))
        })
        .cloned()
        .collect()
}

/// Highest confidence among the filtered detections, or 0.
pub fn score(detections: &[Detection]) -> f32 {
    detections.iter().fold(0f32, |acc, d| acc.max(d.conf))
}

pub fn is_relevant(detections: &[Detection]) -> bool {
    !detections.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BBox;

    fn det(cls: &str, conf: f32) -> Detection {
        Detection {
            cls: cls.to_owned(),
            conf,
            bbox: BBox {
                x: 0.,
                y: 0.,
                w: 1.,
                h: 1.,
            },
            track_id: None,
        }
    }

    fn config(threshold: f32, classes: &[&str]) -> FilterConfig {
        FilterConfig {
            threshold,
            allowed_classes: classes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn threshold_gate() {
        let out = filter(
            &[det("person", 0.4), det("person", 0.5), det("person", 0.6)],
            &config(0.5, &[]),
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.conf >= 0.5));
    }

    #[test]
    fn class_allowlist() {
        let out = filter(
            &[det("person", 0.9), det("car", 0.9), det("dog", 0.9)],
            &config(0.5, &["person", "dog"]),
        );
        assert_eq!(
            out.iter().map(|d| d.cls.as_str()).collect::<Vec<_>>(),
            ["person", "dog"]
        );
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let out = filter(&[det("person", 0.9), det("car", 0.9)], &config(0.5, &[]));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn score_is_max_or_zero() {
        assert_eq!(score(&[]), 0.);
        assert_eq!(score(&[det("a", 0.3), det("b", 0.7), det("c", 0.5)]), 0.7);
    }

    #[test]
    fn relevance_is_non_empty() {
        assert!(!is_relevant(&[]));
        assert!(is_relevant(&[det("person", 0.9)]));
    }
}
