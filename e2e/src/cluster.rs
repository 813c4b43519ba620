//! The handle to the cluster under test.
//!
//! A [`ClusterHandle`] is immutable after construction and cheap to clone;
//! the kube client it carries is already `Arc`-backed. Every call it makes
//! uses the cluster's kubecontext.

use crate::{
    errors::{Error, Result},
    forward::{ForwardTarget, PortForwardBuilder},
    kubectl::{Kubectl, Manifest},
};
use harrier_k8s_api as k8s;
use kube::ResourceExt;

#[derive(Clone)]
pub struct ClusterHandle {
    name: String,
    client: kube::Client,
    kubectl: Kubectl,
}

impl ClusterHandle {
    /// Connects to the named cluster using the ambient kubeconfig, with the
    /// cluster name as the kubecontext.
    pub async fn connect(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let options = kube::config::KubeConfigOptions {
            context: Some(name.clone()),
            ..Default::default()
        };
        let config = match kube::Config::from_kubeconfig(&options).await {
            Ok(config) => config,
            Err(error) => {
                // Fall back to the default context (in-cluster or ambient)
                // when the named context is absent, e.g. under CI harnesses
                // that pre-select the context.
                tracing::debug!(%name, %error, "kubecontext not found; using default");
                kube::Config::infer()
                    .await
                    .map_err(|e| Error::Validation(format!("no usable kubeconfig: {e}")))?
            }
        };
        let client = kube::Client::try_from(config)?;
        Ok(Self::new(name.clone(), client, Kubectl::new(name)))
    }

    pub fn new(name: impl Into<String>, client: kube::Client, kubectl: Kubectl) -> Self {
        Self {
            name: name.into(),
            client,
            kubectl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub fn kubectl(&self) -> &Kubectl {
        &self.kubectl
    }

    pub async fn apply(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<()> {
        self.kubectl.apply(manifest, namespace).await
    }

    pub async fn delete(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<()> {
        self.kubectl.delete(manifest, namespace).await
    }

    pub async fn delete_ignore_missing(
        &self,
        manifest: &Manifest,
        namespace: Option<&str>,
    ) -> Result<()> {
        self.kubectl.delete_ignore_not_found(manifest, namespace).await
    }

    /// Fetches a namespaced object, mapping a 404 to [`Error::NotFound`].
    pub async fn get<T>(&self, namespace: &str, name: &str) -> Result<T>
    where
        T: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        let api = kube::Api::<T>::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::NotFound {
                kind: T::kind(&Default::default()).into_owned(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn scale(&self, namespace: &str, deployment: &str, replicas: u32) -> Result<()> {
        self.kubectl.scale(namespace, deployment, replicas).await
    }

    /// Runs a command inside a pod's container and returns (stdout, stderr).
    pub async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<(String, String)> {
        let out = self.kubectl.exec(namespace, pod, container, argv).await?;
        Ok((out.stdout, out.stderr))
    }

    /// Starts building a port-forward to the target; see
    /// [`PortForwardBuilder`] for knobs.
    pub fn port_forward(&self, target: ForwardTarget, remote_port: u16) -> PortForwardBuilder {
        PortForwardBuilder::new(self.clone(), target, remote_port)
    }

    /// Pods currently selected by the deployment's label selector.
    pub async fn pods_for_deployment(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let deploy: k8s::Deployment = self.get(namespace, name).await?;
        let labels = deploy
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .ok_or_else(|| {
                Error::Validation(format!("deployment {namespace}/{name} has no label selector"))
            })?;
        let selector: k8s::Selector = labels.into_iter().collect();
        self.pods_matching(namespace, &selector.to_string()).await
    }

    /// Pods currently selected by the service's selector.
    pub async fn pods_for_service(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let svc: k8s::Service = self.get(namespace, name).await?;
        let labels = svc.spec.as_ref().and_then(|s| s.selector.clone()).ok_or_else(|| {
            Error::Validation(format!("service {namespace}/{name} has no selector"))
        })?;
        let selector: k8s::Selector = labels.into_iter().collect();
        self.pods_matching(namespace, &selector.to_string()).await
    }

    pub async fn pods_matching(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let api = kube::Api::<k8s::Pod>::namespaced(self.client.clone(), namespace);
        let params = kube::api::ListParams::default().labels(selector);
        let pods = api.list(&params).await?;
        Ok(pods.items.iter().map(|p| p.name_any()).collect())
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
