use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::database::models::Event;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventGrouping {
    pub events: Vec<Event>,
    /// (photo path, event id) for every dated photo.
    pub assignments: Vec<(String, i64)>,
}

/// Split dated photos into events wherever consecutive capture times are
/// more than `gap_hours` apart. Undated photos belong to no event.
///
/// Photos are ordered by (capture time, path) so equal timestamps stay
/// deterministic; event ids run 1.. in time order.
pub fn group_events(photos: &[(String, Option<NaiveDateTime>)], gap_hours: f64) -> EventGrouping {
    let mut dated: Vec<(&str, NaiveDateTime)> = photos
        .iter()
        .filter_map(|(path, time)| time.map(|t| (path.as_str(), t)))
        .collect();
    dated.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let gap = Duration::milliseconds((gap_hours.max(0.0) * 3_600_000.0).round() as i64);
    let mut grouping = EventGrouping::default();
    let mut current: Option<Event> = None;

    for (path, time) in dated {
        match current.as_mut() {
            Some(event) if time - event.end <= gap => {
                event.end = time;
                event.members.push(path.to_string());
            }
            _ => {
                if let Some(done) = current.take() {
                    grouping.events.push(done);
                }
                current = Some(Event {
                    id: grouping.events.len() as i64 + 1,
                    start: time,
                    end: time,
                    members: vec![path.to_string()],
                });
            }
        }
    }
    if let Some(done) = current {
        grouping.events.push(done);
    }

    for event in &mut grouping.events {
        for path in &event.members {
            grouping.assignments.push((path.clone(), event.id));
        }
    }

    grouping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> Option<NaiveDateTime> {
        Some(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap())
    }

    #[test]
    fn test_gap_splits_events() {
        let photos = vec![
            ("/p/c.jpg".to_string(), at("2024-05-01 18:00")),
            ("/p/a.jpg".to_string(), at("2024-05-01 10:00")),
            ("/p/b.jpg".to_string(), at("2024-05-01 13:30")),
            ("/p/undated.jpg".to_string(), None),
        ];
        let grouping = group_events(&photos, 4.0);

        assert_eq!(grouping.events.len(), 2);
        assert_eq!(grouping.events[0].members, vec!["/p/a.jpg", "/p/b.jpg"]);
        assert_eq!(grouping.events[1].members, vec!["/p/c.jpg"]);
        assert_eq!(grouping.events[0].start, at("2024-05-01 10:00").unwrap());
        assert_eq!(grouping.events[0].end, at("2024-05-01 13:30").unwrap());
        assert!(!grouping.assignments.iter().any(|(p, _)| p == "/p/undated.jpg"));
    }

    #[test]
    fn test_gap_equal_to_threshold_stays_together() {
        let photos = vec![
            ("/p/a.jpg".to_string(), at("2024-05-01 10:00")),
            ("/p/b.jpg".to_string(), at("2024-05-01 14:00")),
        ];
        assert_eq!(group_events(&photos, 4.0).events.len(), 1);
    }

    #[test]
    fn test_zero_gap_separates_distinct_times() {
        let photos = vec![
            ("/p/a.jpg".to_string(), at("2024-05-01 10:00")),
            ("/p/b.jpg".to_string(), at("2024-05-01 10:00")),
            ("/p/c.jpg".to_string(), at("2024-05-01 10:01")),
        ];
        let grouping = group_events(&photos, 0.0);
        assert_eq!(grouping.events.len(), 2);
        assert_eq!(grouping.events[0].members.len(), 2);
    }

    #[test]
    fn test_members_follow_capture_time_not_path() {
        let photos = vec![
            ("/p/a_second.jpg".to_string(), at("2024-05-01 11:00")),
            ("/p/z_first.jpg".to_string(), at("2024-05-01 10:00")),
        ];
        let grouping = group_events(&photos, 4.0);
        assert_eq!(grouping.events.len(), 1);
        assert_eq!(
            grouping.events[0].members,
            vec!["/p/z_first.jpg", "/p/a_second.jpg"]
        );
    }

    #[test]
    fn test_no_dated_photos() {
        let photos = vec![("/p/a.jpg".to_string(), None)];
        assert_eq!(group_events(&photos, 4.0), EventGrouping::default());
    }
}
