/*
 * Copyright (C) 2025 The Rbdvol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::rbdvol::util::error::{with_context, DynResult};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static VOLUME_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static VOLUME_OPERATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static MOUNTED_VOLUMES: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn volume_operations_total() -> &'static IntCounterVec {
    VOLUME_OPERATIONS_TOTAL.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "rbdvol_volume_operations_total",
                "Volume driver verbs handled, by operation and outcome.",
            ),
            &["op", "outcome"],
        )
        .expect("valid metric definition");
        registry()
            .register(Box::new(counter.clone()))
            .expect("register volume operation counter");
        counter
    })
}

fn volume_operation_duration() -> &'static HistogramVec {
    VOLUME_OPERATION_DURATION.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "rbdvol_volume_operation_duration_seconds",
                "Wall-clock duration of volume driver verbs.",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["op"],
        )
        .expect("valid metric definition");
        registry()
            .register(Box::new(histogram.clone()))
            .expect("register volume operation histogram");
        histogram
    })
}

fn mounted_volumes() -> &'static IntGauge {
    MOUNTED_VOLUMES.get_or_init(|| {
        let gauge = IntGauge::new(
            "rbdvol_mounted_volumes",
            "Volumes currently mounted on this host.",
        )
        .expect("valid metric definition");
        registry()
            .register(Box::new(gauge.clone()))
            .expect("register mounted volumes gauge");
        gauge
    })
}

pub fn record_operation(op: &str, outcome: &str, duration: Duration) {
    volume_operations_total()
        .with_label_values(&[op, outcome])
        .inc();
    volume_operation_duration()
        .with_label_values(&[op])
        .observe(duration.as_secs_f64());
}

pub fn set_mounted_volumes(count: usize) {
    mounted_volumes().set(count as i64);
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> DynResult<String> {
    let families = registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(|e| with_context(e, "Failed to encode metrics"))?;
    String::from_utf8(buffer).map_err(|e| with_context(e, "Metrics were not valid UTF-8"))
}
