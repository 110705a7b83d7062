#[cfg(test)]
mod tests {
    use crate::types::*;

    fn template(infra: InfraKind) -> Template {
        Template {
            id: TemplateId::new("nodejs-react-dev"),
            name: "Node.js + React".into(),
            compose: "services:\n  backend:\n    image: node:20\n".into(),
            iaas_template: Some("resource \"x\" \"y\" {}".into()),
            iaas_variables: None,
            exposed_ports: vec![3000, 3001, 5432],
            limits: ResourceLimits { memory_mib: 2048, cpu_cores: 2.0 },
            infra,
            region: None,
            visibility: Visibility::Public,
            owner: None,
        }
    }

    #[test]
    fn local_template_validates() {
        assert!(template(InfraKind::Local).validate().is_ok());
    }

    #[test]
    fn cloud_template_requires_iaas_text() {
        let mut t = template(InfraKind::Aws);
        t.iaas_template = None;
        assert!(matches!(
            t.validate(),
            Err(crate::DomainError::MissingIaasTemplate(InfraKind::Aws))
        ));
        t.iaas_template = Some("   ".into());
        assert!(t.validate().is_err());
    }

    #[test]
    fn hybrid_requires_both_documents() {
        let mut t = template(InfraKind::Hybrid);
        assert!(t.validate().is_ok());
        t.compose = String::new();
        assert!(t.validate().is_err());
    }

    #[test]
    fn limits_are_bounded() {
        let mut t = template(InfraKind::Local);
        t.limits.memory_mib = 64;
        assert!(t.validate().is_err());
        t.limits.memory_mib = 2048;
        t.limits.cpu_cores = 8.5;
        assert!(t.validate().is_err());
        t.limits.cpu_cores = 0.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn legal_lifecycle_paths() {
        use EnvironmentStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Failed));
        // stop() is accepted while still creating
        assert!(Creating.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Failed.can_transition_to(Starting));
        assert!(Error.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Destroyed));
    }

    #[test]
    fn illegal_lifecycle_paths() {
        use EnvironmentStatus::*;
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Error));
        assert!(!Deleting.can_transition_to(Deleting));
        for next in [Creating, Starting, Running, Stopping, Stopped, Deleting, Failed, Error] {
            assert!(!Destroyed.can_transition_to(next), "DESTROYED → {next}");
        }
    }

    #[test]
    fn error_is_reachable_from_every_non_terminal_state() {
        use EnvironmentStatus::*;
        for from in [Creating, Starting, Running, Stopping, Stopped, Deleting, Failed] {
            assert!(from.can_transition_to(Error), "{from} → ERROR");
        }
        assert!(!Destroyed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn delete_is_legal_from_every_live_state() {
        use EnvironmentStatus::*;
        for from in [Creating, Starting, Running, Stopping, Stopped, Failed, Error] {
            assert!(from.can_transition_to(Deleting), "{from} → DELETING");
        }
        assert!(!Deleting.can_transition_to(Deleting));
        assert!(!Destroyed.can_transition_to(Deleting));
    }

    #[test]
    fn status_serializes_to_wire_form() {
        let s = serde_json::to_string(&EnvironmentStatus::Running).unwrap();
        assert_eq!(s, "\"RUNNING\"");
        let k = serde_json::to_string(&MetricKind::Cpu).unwrap();
        assert_eq!(k, "\"CPU\"");
    }

    #[test]
    fn destroyed_environment_owns_nothing() {
        let t = template(InfraKind::Local);
        let mut env = Environment::new(
            &t,
            "demo",
            OwnerId::new("user-1"),
            8,
            chrono::Utc::now(),
        );
        env.port_map.insert(3000, 8000);
        env.resource_map.insert("instance_id".into(), "i-123".into());
        env.archive_id = Some(ArchiveId::random());
        env.clear_owned_resources();
        assert!(env.port_map.is_empty());
        assert!(env.resource_map.is_empty());
        assert!(env.archive_id.is_none());
    }

    #[test]
    fn container_engine_id_implies_started() {
        let mut c = ContainerInstance::new(EnvironmentId::random(), "db");
        assert!(c.invariant_holds());
        c.engine_id = Some("abc123".into());
        assert!(!c.invariant_holds());
        c.status = ContainerStatus::Running;
        assert!(c.invariant_holds());
    }

    #[test]
    fn visibility_permits() {
        let alice = OwnerId::new("alice");
        let bob = OwnerId::new("bob");
        assert!(Visibility::Public.permits(&alice, None));
        assert!(Visibility::Private.permits(&alice, Some(&alice)));
        assert!(!Visibility::Private.permits(&alice, Some(&bob)));
        assert!(Visibility::Owner(alice.clone()).permits(&alice, None));
        assert!(!Visibility::Owner(bob).permits(&alice, None));
    }
}
