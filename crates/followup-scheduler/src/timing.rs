//! Send-time predictor.
//! Buckets response and engagement history by (hour, day-of-week) in UTC,
//! scores each bucket, and picks the hour with the highest combined score.
//!
//! Everything here is a pure function of the samples and `now`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use followup_core::config::PredictorConfig;
use followup_core::types::{EngagementSample, PredictionSource, ResponseSample, TimingPrediction};
use serde::Serialize;

/// Response samples needed before the response signal is trusted.
pub const MIN_RESPONSE_SAMPLES: usize = 5;
/// Engagement samples needed before the engagement signal is trusted.
pub const MIN_ENGAGEMENT_SAMPLES: usize = 10;

const MAX_CONFIDENCE: f64 = 0.95;
const DEFAULT_CONFIDENCE: f64 = 0.1;
/// Stand-in average when nobody in a bucket ever replied.
const NO_RESPONSE_MINUTES: f64 = 999.0;

/// Signal weights when both are usable.
const RESPONSE_WEIGHT: f64 = 0.6;
const ENGAGEMENT_WEIGHT: f64 = 0.4;
/// Shares of rate and speed inside a response bucket score.
const RATE_SHARE: f64 = 0.6;
const SPEED_SHARE: f64 = 0.4;

/// Scored response history for one (hour, day-of-week) bucket.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseBucket {
    pub hour: u32,
    /// 0 = Sunday.
    pub day_of_week: u32,
    pub sent: u32,
    pub responded: u32,
    pub avg_response_minutes: f64,
    pub score: f64,
}

/// Scored engagement history for one (hour, day-of-week) bucket.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngagementBucket {
    pub hour: u32,
    pub day_of_week: u32,
    pub events: u32,
    pub active_days: u32,
    pub score: f64,
}

/// Per-hour response analytics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HourlyResponseStats {
    pub hour: u32,
    pub sent: u32,
    pub responded: u32,
    pub avg_response_minutes: Option<f64>,
}

fn day_of_week(t: DateTime<Utc>) -> u32 {
    t.weekday().num_days_from_sunday()
}

fn in_window(t: DateTime<Utc>, now: DateTime<Utc>, window_days: i64) -> bool {
    let start = Duration::try_days(window_days).and_then(|w| now.checked_sub_signed(w));
    t <= now && start.is_none_or(|start| t >= start)
}

/// Response-pattern buckets: 0.6 x (rate x 60) + 0.4 x max(0, 40 - avgMinutes / 10).
pub fn response_buckets(
    samples: &[ResponseSample],
    now: DateTime<Utc>,
    window_days: i64,
) -> Vec<ResponseBucket> {
    #[derive(Default)]
    struct Acc {
        sent: u32,
        responded: u32,
        minutes: f64,
    }

    let mut acc: BTreeMap<(u32, u32), Acc> = BTreeMap::new();
    for s in samples.iter().filter(|s| in_window(s.sent_at, now, window_days)) {
        let a = acc
            .entry((s.sent_at.hour(), day_of_week(s.sent_at)))
            .or_default();
        a.sent += 1;
        if let Some(m) = s.response_minutes() {
            a.responded += 1;
            a.minutes += m.max(0.0);
        }
    }

    acc.into_iter()
        .map(|((hour, dow), a)| {
            let rate = a.responded as f64 / a.sent as f64;
            let avg = if a.responded > 0 {
                a.minutes / a.responded as f64
            } else {
                NO_RESPONSE_MINUTES
            };
            let rate_score = rate * 60.0;
            let speed_score = (40.0 - avg / 10.0).max(0.0);
            ResponseBucket {
                hour,
                day_of_week: dow,
                sent: a.sent,
                responded: a.responded,
                avg_response_minutes: avg,
                score: RATE_SHARE * rate_score + SPEED_SHARE * speed_score,
            }
        })
        .collect()
}

/// Engagement-pattern buckets: (events / total) x 70 + (active days / window) x 30.
pub fn engagement_buckets(
    samples: &[EngagementSample],
    now: DateTime<Utc>,
    window_days: i64,
) -> Vec<EngagementBucket> {
    let mut acc: BTreeMap<(u32, u32), (u32, BTreeSet<NaiveDate>)> = BTreeMap::new();
    let mut total = 0u32;
    for s in samples.iter().filter(|s| in_window(s.occurred_at, now, window_days)) {
        let entry = acc
            .entry((s.occurred_at.hour(), day_of_week(s.occurred_at)))
            .or_default();
        entry.0 += 1;
        entry.1.insert(s.occurred_at.date_naive());
        total += 1;
    }

    let window = window_days.max(1) as f64;
    acc.into_iter()
        .map(|((hour, dow), (events, days))| {
            let frequency = events as f64 / total as f64 * 70.0;
            let consistency = days.len() as f64 / window * 30.0;
            EngagementBucket {
                hour,
                day_of_week: dow,
                events,
                active_days: days.len() as u32,
                score: frequency + consistency,
            }
        })
        .collect()
}

/// Pick the best send hour (and maybe weekday) for one subject.
pub fn predict(
    responses: &[ResponseSample],
    engagements: &[EngagementSample],
    now: DateTime<Utc>,
    config: &PredictorConfig,
) -> TimingPrediction {
    let response_count = responses
        .iter()
        .filter(|s| in_window(s.sent_at, now, config.response_window_days))
        .count();
    let engagement_count = engagements
        .iter()
        .filter(|s| in_window(s.occurred_at, now, config.engagement_window_days))
        .count();

    let has_response = response_count >= MIN_RESPONSE_SAMPLES;
    let has_engagement = engagement_count >= MIN_ENGAGEMENT_SAMPLES;

    if !has_response && !has_engagement {
        return TimingPrediction {
            hour: config.default_hour,
            day_of_week: None,
            confidence: DEFAULT_CONFIDENCE,
            source: PredictionSource::Default,
            score: 0.0,
            reason: format!(
                "Not enough history ({response_count} responses, {engagement_count} engagement events)"
            ),
        };
    }

    let (response_weight, engagement_weight, source) = match (has_response, has_engagement) {
        (true, true) => (RESPONSE_WEIGHT, ENGAGEMENT_WEIGHT, PredictionSource::Combined),
        (true, false) => (1.0, 0.0, PredictionSource::Response),
        _ => (0.0, 1.0, PredictionSource::Engagement),
    };

    let response = if has_response {
        response_buckets(responses, now, config.response_window_days)
    } else {
        Vec::new()
    };
    let engagement = if has_engagement {
        engagement_buckets(engagements, now, config.engagement_window_days)
    } else {
        Vec::new()
    };

    let mut hour_scores = [0.0f64; 24];
    for b in &response {
        hour_scores[b.hour as usize] += response_weight * b.score;
    }
    for b in &engagement {
        hour_scores[b.hour as usize] += engagement_weight * b.score;
    }

    let mut best_hour = config.default_hour;
    let mut best_score = 0.0;
    for (hour, score) in hour_scores.iter().enumerate() {
        if *score > best_score {
            best_score = *score;
            best_hour = hour as u32;
        }
    }

    // Weekday preference comes from the response signal only.
    let mut best_day = None;
    let mut best_day_score = f64::MIN;
    for b in response.iter().filter(|b| b.hour == best_hour) {
        if b.score > best_day_score {
            best_day_score = b.score;
            best_day = Some(b.day_of_week);
        }
    }

    let total = response_count + engagement_count;
    let confidence = (MAX_CONFIDENCE.min(total as f64 / 50.0) * 100.0).round() / 100.0;

    let mut signals = Vec::new();
    if has_response {
        signals.push("response history");
    }
    if has_engagement {
        signals.push("engagement patterns");
    }

    TimingPrediction {
        hour: best_hour,
        day_of_week: best_day,
        confidence,
        source,
        score: best_score,
        reason: format!("Based on {total} data points from {}", signals.join(" and ")),
    }
}

/// Next instant at `hour:00` UTC after `now`, moved forward to `weekday` (0 = Sunday) if set.
pub fn next_slot(hour: u32, weekday: Option<u32>, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let mut target = midnight + Duration::hours(i64::from(hour.min(23)));
    if target <= now {
        target += Duration::days(1);
    }
    if let Some(wanted) = weekday.map(|d| d % 7) {
        let current = day_of_week(target);
        if current != wanted {
            let days = (wanted + 7 - current) % 7;
            target += Duration::days(i64::from(if days == 0 { 7 } else { days }));
        }
    }
    target
}

/// Instant for a prediction, see [`next_slot`].
pub fn slot_for(prediction: &TimingPrediction, now: DateTime<Utc>) -> DateTime<Utc> {
    next_slot(prediction.hour, prediction.day_of_week, now)
}

/// Label for the learned contact time.
pub fn time_period(hour: u32) -> &'static str {
    match hour {
        6..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

/// Sent / responded / average response minutes per hour of day.
pub fn hourly_response_stats(samples: &[ResponseSample]) -> Vec<HourlyResponseStats> {
    let mut acc: BTreeMap<u32, (u32, u32, f64)> = BTreeMap::new();
    for s in samples {
        let e = acc.entry(s.sent_at.hour()).or_default();
        e.0 += 1;
        if let Some(m) = s.response_minutes() {
            e.1 += 1;
            e.2 += m.max(0.0);
        }
    }
    acc.into_iter()
        .map(|(hour, (sent, responded, minutes))| HourlyResponseStats {
            hour,
            sent,
            responded,
            avg_response_minutes: (responded > 0).then(|| minutes / responded as f64),
        })
        .collect()
}
