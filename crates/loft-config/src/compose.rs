use std::collections::BTreeMap;

use loft_domain::{ComposeDocument, ComposeService, PortMapping, VolumeMount};

use crate::error::ConfigError;
use crate::raw::{RawCompose, RawEnvironment, RawPort, RawService};

/// Parse a template's compose-style document into its canonical form.
///
/// Validation performed here:
/// - at least one service
/// - every service declares an `image`
/// - port specs are well-formed and in [1, 65535]
/// - `depends_on` names refer to declared services
///
/// Cycle detection over `depends_on` is the dependency graph's job, not the
/// parser's.
pub fn parse_compose(text: &str) -> Result<ComposeDocument, ConfigError> {
    let raw: RawCompose = serde_yaml::from_str(text)?;

    if raw.services.is_empty() {
        return Err(ConfigError::NoServices);
    }

    let names: Vec<String> = raw.services.keys().cloned().collect();
    let mut services = BTreeMap::new();
    for (name, raw_svc) in raw.services {
        let svc = convert_service(&name, raw_svc, &names)?;
        services.insert(name, svc);
    }

    Ok(ComposeDocument {
        services,
        volumes: raw.volumes.into_keys().collect(),
        networks: raw.networks.into_keys().collect(),
    })
}

fn convert_service(
    name: &str,
    raw: RawService,
    declared: &[String],
) -> Result<ComposeService, ConfigError> {
    let image = raw
        .image
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingImage { service: name.to_string() })?;

    let mut ports = Vec::with_capacity(raw.ports.len());
    for p in raw.ports {
        ports.push(convert_port(name, p)?);
    }

    for dep in &raw.depends_on {
        if !declared.iter().any(|s| s == dep) {
            return Err(ConfigError::UnknownDependency {
                service: name.to_string(),
                depends_on: dep.clone(),
            });
        }
    }

    let mut volumes = Vec::with_capacity(raw.volumes.len());
    for v in &raw.volumes {
        volumes.push(convert_volume(name, v)?);
    }

    Ok(ComposeService {
        image,
        ports,
        environment: convert_environment(name, raw.environment)?,
        depends_on: raw.depends_on,
        volumes,
        health_url: raw.health_url,
    })
}

fn convert_port(service: &str, raw: RawPort) -> Result<PortMapping, ConfigError> {
    let bad = |spec: String| ConfigError::InvalidPort { service: service.to_string(), spec };

    match raw {
        RawPort::Number(n) => {
            let container = u16::try_from(n).map_err(|_| bad(n.to_string()))?;
            if container == 0 {
                return Err(bad(n.to_string()));
            }
            Ok(PortMapping { container, host_hint: None })
        }
        RawPort::Spec(s) => {
            // "host:container" or bare "container"
            let parse = |p: &str| -> Result<u16, ConfigError> {
                let v: u16 = p.trim().parse().map_err(|_| bad(s.clone()))?;
                if v == 0 {
                    return Err(bad(s.clone()));
                }
                Ok(v)
            };
            match s.split_once(':') {
                Some((host, container)) => Ok(PortMapping {
                    container: parse(container)?,
                    host_hint: Some(parse(host)?),
                }),
                None => Ok(PortMapping { container: parse(&s)?, host_hint: None }),
            }
        }
    }
}

fn convert_environment(
    service: &str,
    raw: RawEnvironment,
) -> Result<BTreeMap<String, String>, ConfigError> {
    match raw {
        RawEnvironment::Empty => Ok(BTreeMap::new()),
        RawEnvironment::Map(m) => Ok(m),
        RawEnvironment::List(entries) => {
            let mut out = BTreeMap::new();
            for entry in entries {
                let (k, v) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidEnvEntry {
                    service: service.to_string(),
                    entry: entry.clone(),
                })?;
                out.insert(k.to_string(), v.to_string());
            }
            Ok(out)
        }
    }
}

fn convert_volume(service: &str, spec: &str) -> Result<VolumeMount, ConfigError> {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let target = parts.next().ok_or_else(|| ConfigError::InvalidVolume {
        service: service.to_string(),
        spec: spec.to_string(),
    })?;
    let read_only = parts.next() == Some("ro");
    Ok(VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
services:
  backend:
    image: node:20
    ports:
      - "3000:3000"
      - 9229
    environment:
      NODE_ENV: development
    depends_on:
      - db
  frontend:
    image: nginx:1.27
    ports:
      - "3001:80"
    depends_on:
      - backend
  db:
    image: postgres:16
    ports:
      - "5432"
    environment:
      - POSTGRES_PASSWORD=dev
    volumes:
      - dbdata:/var/lib/postgresql/data
volumes:
  dbdata: {}
"#;

    #[test]
    fn parses_three_services() {
        let doc = parse_compose(DOC).unwrap();
        assert_eq!(doc.services.len(), 3);
        assert_eq!(doc.volumes, vec!["dbdata".to_string()]);

        let backend = doc.service("backend").unwrap();
        assert_eq!(backend.image, "node:20");
        assert_eq!(backend.ports[0], PortMapping { container: 3000, host_hint: Some(3000) });
        assert_eq!(backend.ports[1], PortMapping { container: 9229, host_hint: None });
        assert_eq!(backend.environment["NODE_ENV"], "development");
        assert_eq!(backend.depends_on, vec!["db".to_string()]);
    }

    #[test]
    fn list_environment_form() {
        let doc = parse_compose(DOC).unwrap();
        assert_eq!(doc.service("db").unwrap().environment["POSTGRES_PASSWORD"], "dev");
    }

    #[test]
    fn volume_mounts_parse() {
        let doc = parse_compose(DOC).unwrap();
        let v = &doc.service("db").unwrap().volumes[0];
        assert_eq!(v.source, "dbdata");
        assert_eq!(v.target, "/var/lib/postgresql/data");
        assert!(!v.read_only);
    }

    #[test]
    fn exposed_ports_are_sorted_and_deduped() {
        let doc = parse_compose(DOC).unwrap();
        assert_eq!(doc.exposed_container_ports(), vec![80, 3000, 5432, 9229]);
    }

    #[test]
    fn missing_image_is_rejected() {
        let err = parse_compose("services:\n  a:\n    ports: [80]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingImage { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let text = "services:\n  a:\n    image: x\n    depends_on: [ghost]\n";
        let err = parse_compose(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn zero_port_is_rejected() {
        let text = "services:\n  a:\n    image: x\n    ports: [\"0:80\"]\n";
        assert!(parse_compose(text).is_err());
    }

    #[test]
    fn empty_document_is_rejected() {
        assert!(matches!(parse_compose("services: {}\n"), Err(ConfigError::NoServices)));
    }
}
