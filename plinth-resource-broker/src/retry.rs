// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::model::RetrySpec;
use rand::Rng;
use std::time::Duration;

/// Delay for attempt `k` (1-indexed):
/// `min(maxDelayMs, baseDelayMs · 2^(k-1)) · (1 + uniform(-jitter, +jitter))`.
pub fn backoff_delay(spec: &RetrySpec, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = spec
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    let capped = raw.min(spec.max_delay_ms) as f64;

    let jitter = spec.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::rng().random_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((capped * factor).round().max(0.0) as u64)
}
