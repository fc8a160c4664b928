//! Deployment orchestration: application workloads plus the optional
//! authenticating proxy in front of them.
//!
//! Every object has a deterministic name, so each call is a create-or-replace
//! and repeated deploys converge on the same state.

use std::sync::Arc;

use crate::config::AuthProxySettings;
use crate::error::Error;
use crate::models::workload::{
    annotations, Container, ContainerPort, Deployment, DeploymentSpec, EnvVar, Ingress,
    IngressPath, IngressRule, IngressSpec, IngressTls, PathType, PodSpec, PodTemplate, Service,
    ServiceBackend, ServicePort, ServiceSpec,
};
use crate::models::{Environment, Instance, Labels, ObjectMeta, Resource};
use crate::naming;
use crate::services::identity_service::{ensure_group, IdentityProvider};
use crate::store::{Api, DeleteOutcome};

const PROXY_PORT: u16 = 4180;
const PROXY_CONTAINER: &str = "oauth2-proxy";
const APP_PORT_NAME: &str = "http";

#[derive(Clone)]
pub struct DeployService {
    deployments: Api<Deployment>,
    services: Api<Service>,
    ingresses: Api<Ingress>,
    instances: Api<Instance>,
    auth_proxy: Option<AuthProxySettings>,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl DeployService {
    pub fn new(
        deployments: Api<Deployment>,
        services: Api<Service>,
        ingresses: Api<Ingress>,
        instances: Api<Instance>,
        auth_proxy: Option<AuthProxySettings>,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            deployments,
            services,
            ingresses,
            instances,
            auth_proxy,
            identity,
        }
    }

    /// Converge the workloads of `instance` and persist its public URL and
    /// the commit now being served.
    /// Application workload failures propagate; proxy failures degrade to
    /// unauthenticated access.
    pub async fn deploy(&self, env: &Environment, instance: &mut Instance) -> Result<(), Error> {
        let name = instance.name().to_string();
        let path = naming::http_path(env, instance);
        let host = env.spec.application_settings.ingress_hostname.clone();

        self.deployments
            .create_or_replace(&self.app_deployment(env, instance))
            .await?;
        self.services
            .create_or_replace(&self.app_service(env, instance))
            .await?;

        let proxied = match &self.auth_proxy {
            Some(settings) if env.requires_authentication() => {
                match self.deploy_proxy(env, instance, settings, &path).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            instance = %name,
                            error = %e,
                            "Auth proxy deployment failed, serving without authentication"
                        );
                        false
                    }
                }
            }
            _ => {
                self.remove_proxy(&name).await?;
                false
            }
        };

        self.ingresses
            .create_or_replace(&self.app_ingress(env, instance, &path, proxied))
            .await?;

        let url = naming::public_url(&host, &path);
        let commit = instance.commit_hash().to_string();
        if instance.status.public_facing_url != url || instance.status.deployed_commit != commit {
            instance.status.public_facing_url = url;
            instance.status.deployed_commit = commit;
            *instance = self.instances.replace_status(instance).await?;
        }
        tracing::info!(
            instance = %name,
            url = %instance.status.public_facing_url,
            proxied,
            "Deployed instance"
        );
        Ok(())
    }

    /// Delete every workload of the instance; missing objects are fine.
    pub async fn remove(&self, instance: &str) -> Result<(), Error> {
        self.remove_proxy(instance).await?;
        self.ingresses.delete(instance).await?;
        self.services.delete(instance).await?;
        self.deployments.delete(instance).await?;
        Ok(())
    }

    async fn remove_proxy(&self, instance: &str) -> Result<(), Error> {
        let proxy = naming::auth_proxy_name(instance);
        let removed = [
            self.ingresses.delete(&proxy).await?,
            self.services.delete(&proxy).await?,
            self.deployments.delete(&proxy).await?,
        ];
        if removed.contains(&DeleteOutcome::Deleted) {
            tracing::info!(instance, "Removed auth proxy");
        }
        Ok(())
    }

    async fn deploy_proxy(
        &self,
        env: &Environment,
        instance: &Instance,
        settings: &AuthProxySettings,
        path: &str,
    ) -> Result<(), Error> {
        let mut group = None;
        if let Some(identity) = &self.identity {
            if let Err(e) = self.sync_group(identity.as_ref(), env, instance).await {
                tracing::warn!(instance = %instance.name(), error = %e, "Access group sync failed");
            }
            group = Some(instance.name().to_string());
        }

        self.deployments
            .create_or_replace(&self.proxy_deployment(env, instance, settings, path, group))
            .await?;
        self.services
            .create_or_replace(&self.proxy_service(env, instance))
            .await?;
        self.ingresses
            .create_or_replace(&self.proxy_ingress(env, instance, path))
            .await?;
        Ok(())
    }

    /// Group named after the instance holding the owner and authorized users.
    async fn sync_group(
        &self,
        identity: &dyn IdentityProvider,
        env: &Environment,
        instance: &Instance,
    ) -> Result<(), Error> {
        let group = ensure_group(identity, instance.name()).await?;
        let members = std::iter::once(env.owner())
            .chain(env.spec.access_settings.users.iter().map(|u| u.user_id.as_str()))
            .filter(|id| !id.is_empty());
        for user_id in members {
            identity.add_user_to_group(user_id, &group.id).await?;
        }
        Ok(())
    }

    fn app_labels(env: &Environment, instance: &Instance) -> Labels {
        Labels::from([
            (naming::LABEL_APP.to_string(), instance.name().to_string()),
            (naming::LABEL_OWNER.to_string(), env.owner().to_string()),
        ])
    }

    fn app_deployment(&self, env: &Environment, instance: &Instance) -> Deployment {
        let app = &env.spec.application_settings;
        let labels = Self::app_labels(env, instance);
        let command = app
            .command
            .as_deref()
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());

        Deployment {
            metadata: ObjectMeta::new(instance.namespace(), instance.name())
                .with_labels(labels.clone()),
            spec: DeploymentSpec {
                replicas: 1,
                selector: labels.clone(),
                template: PodTemplate {
                    labels,
                    spec: PodSpec {
                        containers: vec![Container {
                            name: instance.name().to_string(),
                            image: naming::image_reference(env, instance.commit_hash()),
                            command,
                            ports: vec![ContainerPort {
                                name: APP_PORT_NAME.to_string(),
                                container_port: app.port,
                                protocol: "TCP".to_string(),
                            }],
                            env: app
                                .environment_variables
                                .iter()
                                .map(|v| EnvVar {
                                    name: v.key.clone(),
                                    value: v.value.clone(),
                                })
                                .collect(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
                strategy: "RollingUpdate".to_string(),
            },
        }
    }

    fn app_service(&self, env: &Environment, instance: &Instance) -> Service {
        let labels = Self::app_labels(env, instance);
        let port = env.spec.application_settings.port;
        Service {
            metadata: ObjectMeta::new(instance.namespace(), instance.name())
                .with_labels(labels.clone()),
            spec: ServiceSpec {
                selector: labels,
                ports: vec![ServicePort {
                    name: APP_PORT_NAME.to_string(),
                    port,
                    target_port: port,
                }],
            },
        }
    }

    fn app_ingress(
        &self,
        env: &Environment,
        instance: &Instance,
        path: &str,
        proxied: bool,
    ) -> Ingress {
        let host = &env.spec.application_settings.ingress_hostname;
        let mut metadata = ObjectMeta::new(instance.namespace(), instance.name())
            .with_labels(Self::app_labels(env, instance));
        let mut tls = Vec::new();

        if proxied {
            let proxy = naming::auth_proxy_name(instance.name());
            let proxy_path = naming::auth_proxy_path(path);
            metadata.annotations = annotations([
                ("nginx.ingress.kubernetes.io/rewrite-target", "/".to_string()),
                (
                    "nginx.ingress.kubernetes.io/auth-url",
                    format!(
                        "http://{proxy}.{}.svc.cluster.local:{PROXY_PORT}{proxy_path}/auth",
                        instance.namespace()
                    ),
                ),
                (
                    "nginx.ingress.kubernetes.io/auth-signin",
                    format!("https://{host}{proxy_path}/start?rd=$escaped_request_uri"),
                ),
                ("cert-manager.io/cluster-issuer", "letsencrypt-prod".to_string()),
            ]);
            tls.push(IngressTls {
                hosts: vec![host.clone()],
                secret_name: naming::tls_secret_name(instance.name()),
            });
        } else {
            metadata.annotations =
                annotations([("nginx.ingress.kubernetes.io/rewrite-target", "/".to_string())]);
        }

        Ingress {
            metadata,
            spec: IngressSpec {
                rules: vec![IngressRule {
                    host: host.clone(),
                    paths: vec![IngressPath {
                        path: path.to_string(),
                        path_type: PathType::ImplementationSpecific,
                        backend: ServiceBackend {
                            name: instance.name().to_string(),
                            port: env.spec.application_settings.port,
                        },
                    }],
                }],
                tls,
            },
        }
    }

    fn proxy_labels(env: &Environment, instance: &Instance) -> Labels {
        Labels::from([
            (
                naming::LABEL_APP.to_string(),
                naming::auth_proxy_name(instance.name()),
            ),
            (naming::LABEL_OWNER.to_string(), env.owner().to_string()),
        ])
    }

    fn proxy_deployment(
        &self,
        env: &Environment,
        instance: &Instance,
        settings: &AuthProxySettings,
        path: &str,
        group: Option<String>,
    ) -> Deployment {
        let host = &env.spec.application_settings.ingress_hostname;
        let labels = Self::proxy_labels(env, instance);
        let mut args = vec![
            "--email-domain=*".to_string(),
            "--provider=keycloak-oidc".to_string(),
            format!("--client-id={}", settings.client_id),
            format!("--client-secret={}", settings.client_secret),
            format!("--redirect-url=https://{host}{path}/oauth2/callback"),
            format!("--oidc-issuer-url={}", settings.issuer_url),
            format!("--proxy-prefix={}", naming::auth_proxy_path(path)),
            "--code-challenge-method=S256".to_string(),
            "--standard-logging=true".to_string(),
            "--auth-logging=true".to_string(),
            "--request-logging=true".to_string(),
            format!("--http-address=0.0.0.0:{PROXY_PORT}"),
        ];
        if let Some(group) = group {
            args.push(format!("--allowed-group={group}"));
        }

        Deployment {
            metadata: ObjectMeta::new(instance.namespace(), naming::auth_proxy_name(instance.name()))
                .with_labels(labels.clone()),
            spec: DeploymentSpec {
                replicas: 1,
                selector: labels.clone(),
                template: PodTemplate {
                    labels,
                    spec: PodSpec {
                        containers: vec![Container {
                            name: PROXY_CONTAINER.to_string(),
                            image: settings.image.clone(),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            args,
                            ports: vec![ContainerPort {
                                name: APP_PORT_NAME.to_string(),
                                container_port: PROXY_PORT,
                                protocol: "TCP".to_string(),
                            }],
                            env: vec![EnvVar {
                                name: "OAUTH2_PROXY_COOKIE_SECRET".to_string(),
                                value: settings.cookie_secret.clone(),
                            }],
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
                strategy: "RollingUpdate".to_string(),
            },
        }
    }

    fn proxy_service(&self, env: &Environment, instance: &Instance) -> Service {
        let labels = Self::proxy_labels(env, instance);
        Service {
            metadata: ObjectMeta::new(instance.namespace(), naming::auth_proxy_name(instance.name()))
                .with_labels(labels.clone()),
            spec: ServiceSpec {
                selector: labels,
                ports: vec![ServicePort {
                    name: APP_PORT_NAME.to_string(),
                    port: PROXY_PORT,
                    target_port: PROXY_PORT,
                }],
            },
        }
    }

    fn proxy_ingress(&self, env: &Environment, instance: &Instance, path: &str) -> Ingress {
        let host = &env.spec.application_settings.ingress_hostname;
        let proxy = naming::auth_proxy_name(instance.name());
        let mut metadata = ObjectMeta::new(instance.namespace(), proxy.clone())
            .with_labels(Self::proxy_labels(env, instance));
        metadata.annotations = annotations([
            ("kubernetes.io/ingress.class", "nginx".to_string()),
            ("cert-manager.io/cluster-issuer", "letsencrypt-prod".to_string()),
            ("nginx.ingress.kubernetes.io/proxy-buffer-size", "512k".to_string()),
        ]);

        Ingress {
            metadata,
            spec: IngressSpec {
                rules: vec![IngressRule {
                    host: host.clone(),
                    paths: vec![IngressPath {
                        path: naming::auth_proxy_path(path),
                        path_type: PathType::Prefix,
                        backend: ServiceBackend {
                            name: proxy.clone(),
                            port: PROXY_PORT,
                        },
                    }],
                }],
                tls: vec![IngressTls {
                    hosts: vec![host.clone()],
                    secret_name: naming::tls_secret_name(&proxy),
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::GitTarget;
    use crate::testing::Harness;

    async fn deployed(h: &Harness) -> (Environment, Instance) {
        let mut env = h.create_environment("org", "repo").await;
        env.spec.application_settings.command = Some("node  server.js".into());
        let mut instance = h
            .create_instance(&env, GitTarget::PullRequestNumber(3), "abc")
            .await;
        h.deployer.deploy(&env, &mut instance).await.unwrap();
        (env, instance)
    }

    #[tokio::test]
    async fn deploys_app_behind_proxy() {
        let h = Harness::new();
        let (_, instance) = deployed(&h).await;
        let name = instance.name().to_string();
        let proxy = naming::auth_proxy_name(&name);

        assert_eq!(
            instance.status.public_facing_url,
            "https://preview.example.com/org/repo/3/abc"
        );
        assert_eq!(
            h.instances.get(&name).await.unwrap().status.public_facing_url,
            instance.status.public_facing_url
        );

        let app = h.deployments.get(&name).await.unwrap();
        let container = &app.spec.template.spec.containers[0];
        assert_eq!(container.image, "registry.example.com/previews/pr-env:org-repo-abc");
        assert_eq!(container.command, Some(vec!["node".to_string(), "server.js".to_string()]));
        assert_eq!(container.ports[0].container_port, 8080);

        let ingress = h.ingresses.get(&name).await.unwrap();
        let auth_url = &ingress.metadata.annotations["nginx.ingress.kubernetes.io/auth-url"];
        assert!(auth_url.starts_with(&format!("http://{proxy}.previews.svc.cluster.local:4180")));
        assert!(auth_url.ends_with("/org/repo/3/abc/oauth2/auth"));

        let proxy_ingress = h.ingresses.get(&proxy).await.unwrap();
        let backend = &proxy_ingress.spec.rules[0].paths[0];
        assert_eq!(backend.path, "/org/repo/3/abc/oauth2");
        assert_eq!(backend.backend, ServiceBackend { name: proxy.clone(), port: 4180 });

        let proxy_args = &h.deployments.get(&proxy).await.unwrap().spec.template.spec.containers[0].args;
        assert!(proxy_args.contains(&format!("--allowed-group={name}")));

        // owner joined the access group
        let memberships = h.identity.memberships().await;
        assert!(memberships.iter().any(|(user, _)| user == "owner-1"));
    }

    #[tokio::test]
    async fn public_access_removes_proxy() {
        let h = Harness::new();
        let (mut env, mut instance) = deployed(&h).await;
        let proxy = naming::auth_proxy_name(instance.name());
        assert!(h.deployments.get_opt(&proxy).await.unwrap().is_some());

        env.spec.access_settings.public_access = true;
        h.deployer.deploy(&env, &mut instance).await.unwrap();

        assert!(h.deployments.get_opt(&proxy).await.unwrap().is_none());
        assert!(h.ingresses.get_opt(&proxy).await.unwrap().is_none());
        let ingress = h.ingresses.get(instance.name()).await.unwrap();
        assert!(!ingress
            .metadata
            .annotations
            .contains_key("nginx.ingress.kubernetes.io/auth-url"));
    }

    #[tokio::test]
    async fn redeploy_is_idempotent() {
        let h = Harness::new();
        let (env, mut instance) = deployed(&h).await;
        let before = h.deployments.get(instance.name()).await.unwrap();

        h.deployer.deploy(&env, &mut instance).await.unwrap();

        let after = h.deployments.get(instance.name()).await.unwrap();
        assert_eq!(before.spec, after.spec);
        assert_eq!(h.deployments.list(&Labels::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn identity_outage_still_deploys_proxy() {
        let h = Harness::new();
        h.identity.set_failing(true).await;
        let (_, instance) = deployed(&h).await;
        let proxy = naming::auth_proxy_name(instance.name());
        assert!(h.deployments.get_opt(&proxy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_tolerates_missing_objects() {
        let h = Harness::new();
        let (_, instance) = deployed(&h).await;
        h.deployer.remove(instance.name()).await.unwrap();
        h.deployer.remove(instance.name()).await.unwrap();
        assert!(h.deployments.list(&Labels::new()).await.unwrap().is_empty());
        assert!(h.services.list(&Labels::new()).await.unwrap().is_empty());
        assert!(h.ingresses.list(&Labels::new()).await.unwrap().is_empty());
    }
}
