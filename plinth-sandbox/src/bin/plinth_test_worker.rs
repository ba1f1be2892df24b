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

//! Worker executable used by the sandbox integration tests: a grab bag of
//! handlers exercising the protocol, limits and failure paths.

use plinth_common::codec::Value;
use plinth_common::model::{ErrorCode, LogLevel};
use plinth_worker_sdk::{HandlerError, HandlerRegistry, WorkerServer};
use std::collections::BTreeMap;
use std::time::Duration;

fn input_u64(input: &Value, key: &str) -> Option<u64> {
    input
        .as_map()
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_i64())
        .map(|v| v as u64)
        .or_else(|| input.as_i64().map(|v| v as u64))
}

#[tokio::main]
async fn main() {
    // Booted but silent; used by the ready-timeout test. The variable only
    // reaches the worker when the invocation allow-lists it.
    if std::env::var("TEST_WORKER_MUTE").is_ok() {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    let registry = HandlerRegistry::new()
        .function("echo", |input, _payload, _ctx| async move { Ok(input) })
        .function("sleep", |input, _payload, _ctx| async move {
            let ms = input_u64(&input, "ms").unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::text("woke up"))
        })
        .function("chatty", |input, _payload, ctx| async move {
            let lines = input_u64(&input, "lines").unwrap_or(3);
            for i in 0..lines {
                ctx.log(LogLevel::Info, format!("line {i}"));
            }
            ctx.log_with_meta(
                LogLevel::Debug,
                "done",
                Some(serde_json::json!({"lines": lines})),
            );
            Ok(Value::int(lines as i64))
        })
        .function("alloc", |input, _payload, ctx| async move {
            let mb = input_u64(&input, "mb").unwrap_or(64) as usize;
            let hold_ms = input_u64(&input, "holdMs").unwrap_or(3000);
            ctx.info(format!("allocating {mb}MiB"));
            let mut block = vec![0u8; mb * 1024 * 1024];
            // Touch every page so the allocation is resident.
            for i in (0..block.len()).step_by(4096) {
                block[i] = 1;
            }
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            Ok(Value::int(block.iter().step_by(4096).map(|b| *b as i64).sum()))
        })
        .function("fail", |_input, _payload, _ctx| async {
            Err::<Value, _>(
                HandlerError::new(ErrorCode::HandlerError, "told to fail")
                    .with_stack("at fail (plinth_test_worker)"),
            )
        })
        .function("panic", |_input, _payload, _ctx| async {
            if std::hint::black_box(true) {
                panic!("worker handler panicked on purpose");
            }
            Ok(Value::Null)
        })
        .function("quit", |input, _payload, _ctx| async move {
            // Leaves without a terminal message; the supervisor must write a
            // crash report.
            let code = input_u64(&input, "code").unwrap_or(3) as i32;
            std::process::exit(code);
        })
        .function("env-probe", |_input, _payload, _ctx| async {
            let mut map = BTreeMap::new();
            for (key, value) in std::env::vars() {
                map.insert(key, Value::text(value));
            }
            Ok(Value::Map(map))
        })
        .cli_function("main", |payload, ctx| async move {
            ctx.info(format!("argv: {:?}", payload.argv));
            let code = payload
                .argv
                .first()
                .and_then(|a| a.parse::<i64>().ok())
                .unwrap_or(0);
            Ok(Value::int(code))
        });

    WorkerServer::new(registry).run().await;
}
