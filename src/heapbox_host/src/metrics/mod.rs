/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::time::Duration;

use metrics_macro::NamedMetric;

#[macro_use]
mod metrics_macro;

// These defines all types of metrics in this crate
define_metrics! {
    CounterMetric as counter {
        HostCallRejections { kind: &'static str } => {
            name: "heapbox_host_call_rejections_total",
            description: "Number of host calls from sandboxes that failed validation",
            unit: metrics::Unit::Count,
        },
        MalformedRequests => {
            name: "heapbox_malformed_requests_total",
            description: "Number of host call records with the wrong size",
            unit: metrics::Unit::Count,
        },
        ChildExitsDuringCall => {
            name: "heapbox_child_exits_during_call_total",
            description: "Number of sandboxed processes that exited while a call was in flight",
            unit: metrics::Unit::Count,
        },
    }
    HistogramMetric as histogram {
        SandboxCallDuration { function_index: u32, duration: Duration } => {
            name: "heapbox_sandbox_call_duration_seconds",
            description: "Duration of calls into sandboxed libraries",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    /// Create a new host call rejection metric, ready to be emitted
    #[must_use]
    pub(crate) fn host_call_rejection(kind: &'static str) -> Self {
        CounterMetric::HostCallRejections { kind }
    }
    /// Create a new malformed request metric, ready to be emitted
    #[must_use]
    pub(crate) fn malformed_request() -> Self {
        CounterMetric::MalformedRequests
    }
    /// Create a new child exit metric, ready to be emitted
    #[must_use]
    pub(crate) fn child_exit_during_call() -> Self {
        CounterMetric::ChildExitsDuringCall
    }
}

impl HistogramMetric {
    /// Measures the time to execute the given closure, and then emits the duration
    /// as a sandbox call metric.
    ///
    /// Note: If the `function_call_metrics` feature is not enabled, this function
    /// will simply execute the closure without measuring time or emitting metrics.
    pub(crate) fn time_and_emit_sandbox_call<T, F: FnOnce() -> T>(
        #[allow(unused_variables)] function_index: u32,
        f: F,
    ) -> T {
        cfg_if::cfg_if! {
            if #[cfg(feature = "function_call_metrics")] {
                use std::time::Instant;

                let start = Instant::now();
                let result = f();
                let duration = start.elapsed();
                HistogramMetric::SandboxCallDuration { function_index, duration }.emit();
                result
            } else {
                f()
            }
        }
    }

    /// Create a new sandbox call metric, ready to be emitted
    #[cfg(test)]
    #[must_use]
    fn sandbox_call(function_index: u32, duration: Duration) -> HistogramMetric {
        HistogramMetric::SandboxCallDuration {
            function_index,
            duration,
        }
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    /// Increases the counter represented by `self` by 1
    fn emit(self) {
        self.describe_once();
        let name = self.name();

        match self {
            CounterMetric::HostCallRejections { kind } => {
                static LABEL_KIND: &str = "kind";
                metrics::counter!(name, LABEL_KIND => kind).increment(1);
            }
            CounterMetric::MalformedRequests | CounterMetric::ChildExitsDuringCall => {
                metrics::counter!(name).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        self.describe_once();
        let metric_name = self.name();

        static LABEL_FUNCTION_INDEX: &str = "function_index";

        match self {
            HistogramMetric::SandboxCallDuration {
                function_index,
                duration,
            } => {
                metrics::histogram!(metric_name, LABEL_FUNCTION_INDEX => function_index.to_string())
                    .record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use metrics_util::CompositeKey;

    use super::*;

    #[test]
    fn test_counter_and_histogram_metrics() {
        // Set up the recorder and snapshotter
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let metric_1 = CounterMetric::host_call_rejection("set_range");
        let metric_2 = CounterMetric::malformed_request();
        let metric_3 = CounterMetric::child_exit_during_call();
        let metric_4 = HistogramMetric::sandbox_call(7, Duration::from_secs(2));

        // Perform actions that will update metrics
        let snapshot = metrics::with_local_recorder(&recorder, || {
            metric_1.clone().emit();
            metric_1.clone().emit();
            metric_2.clone().emit();
            metric_3.clone().emit();
            metric_4.clone().emit();

            snapshotter.snapshot()
        });

        // Convert snapshot into a hashmap for easier lookup
        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 4, "Expected four metrics in the snapshot");

        let counter_key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(metric_1.name(), vec![Label::new("kind", "set_range")]),
        );
        assert_eq!(
            snapshot.get(&counter_key).unwrap().2,
            metrics_util::debugging::DebugValue::Counter(2)
        );

        for metric in [&metric_2, &metric_3] {
            let counter_key =
                CompositeKey::new(metrics_util::MetricKind::Counter, metric.name().into());
            assert_eq!(
                snapshot.get(&counter_key).unwrap().2,
                metrics_util::debugging::DebugValue::Counter(1)
            );
        }

        let histogram_key = CompositeKey::new(
            metrics_util::MetricKind::Histogram,
            Key::from_parts(metric_4.name(), vec![Label::new("function_index", "7")]),
        );
        let histogram_value = &snapshot.get(&histogram_key).unwrap().2;
        assert!(
            matches!(
                histogram_value,
                metrics_util::debugging::DebugValue::Histogram(ref histogram) if histogram.len() == 1 && histogram[0].0 == 2.0
            ),
            "Histogram metric does not match expected value"
        );
    }
}
