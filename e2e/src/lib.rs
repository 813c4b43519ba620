#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! An end-to-end test harness for the Harrier gateway.
//!
//! The harness attaches to a running Kubernetes cluster, installs the
//! gateway, and lets test suites apply manifests reversibly, poll the
//! cluster for invariants, and probe the data plane over HTTP.

pub mod admin;
pub mod assertions;
pub mod cluster;
pub mod curl;
pub mod dump;
pub mod errors;
pub mod forward;
pub mod install;
pub mod kubectl;
pub mod operations;
pub mod runtime;
pub mod suite;

pub use self::{
    cluster::ClusterHandle,
    errors::{Error, Result},
    install::InstallContext,
    kubectl::Manifest,
    runtime::RuntimeContext,
    suite::TestInstallation,
};

use harrier_k8s_api as k8s;
use maplit::{btreemap, convert_args};
use tracing::Instrument;

/// Runs a test with a random namespace that is deleted on test completion.
pub async fn with_temp_ns<F, Fut>(client: kube::Client, test: F)
where
    F: FnOnce(kube::Client, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let namespace = format!("harrier-e2e-{}", random_suffix(6));

    let api = kube::Api::<k8s::Namespace>::all(client.clone());
    tracing::debug!(%namespace, "creating");
    let ns = k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(convert_args!(btreemap!(
                "harrier-e2e-test" => std::thread::current().name().unwrap_or(""),
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(
        &kube::api::PostParams {
            dry_run: false,
            field_manager: Some("harrier-e2e".to_string()),
        },
        &ns,
    )
    .await
    .expect("failed to create Namespace");

    let test = test(client.clone(), namespace.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;

    tracing::debug!(%namespace, "deleting");
    api.delete(&namespace, &kube::api::DeleteParams::background())
        .await
        .expect("failed to delete Namespace");
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&LowercaseAlphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Installs a per-test tracing subscriber; keep the guard alive for the
/// duration of the test.
pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "harrier=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

struct LowercaseAlphanumeric;

// Modified from `rand::distributions::Alphanumeric`
//
// Copyright 2018 Developers of the Rand project
// Copyright (c) 2014 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const RANGE: u32 = 26 + 10;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return CHARSET[var as usize];
            }
        }
    }
}
