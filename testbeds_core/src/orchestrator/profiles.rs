use crate::cluster::ResourceProfile;

/// Instances whose test suites need a full core to finish inside the exec timeout.
pub const HIGH_CPU_INSTANCES: &[&str] = &[
    "sympy__sympy-11870",
    "sympy__sympy-13437",
    "matplotlib__matplotlib-24149",
    "matplotlib__matplotlib-23314",
    "matplotlib__matplotlib-24334",
    "matplotlib__matplotlib-26011",
    "mwaskom__seaborn-3407",
    "sympy__sympy-16988",
    "sympy__sympy-17139",
    "sympy__sympy-18057",
    "sympy__sympy-18199",
];

const CPU_LIMIT: &str = "1.2";

impl ResourceProfile {
    pub fn for_instance(instance_id: &str) -> Self {
        let cpu_request = if HIGH_CPU_INSTANCES.contains(&instance_id) {
            "1.0"
        } else {
            "0.1"
        };
        let (memory_request, memory_limit) = if instance_id.starts_with("matplotlib") {
            ("400Mi", "1Gi")
        } else {
            ("100Mi", "600Mi")
        };
        Self {
            cpu_request: cpu_request.to_string(),
            cpu_limit: CPU_LIMIT.to_string(),
            memory_request: memory_request.to_string(),
            memory_limit: memory_limit.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_instances_get_a_full_core() {
        let p = ResourceProfile::for_instance("sympy__sympy-13437");
        assert_eq!(p.cpu_request, "1.0");
        assert_eq!(p.memory_limit, "600Mi");
    }

    #[test]
    fn matplotlib_gets_more_memory() {
        let p = ResourceProfile::for_instance("matplotlib__matplotlib-23299");
        assert_eq!(p.cpu_request, "0.1");
        assert_eq!(p.memory_request, "400Mi");
        assert_eq!(p.memory_limit, "1Gi");
    }

    #[test]
    fn matplotlib_only_matches_as_prefix() {
        let p = ResourceProfile::for_instance("someone__uses-matplotlib-12");
        assert_eq!(p.memory_request, "100Mi");
        assert_eq!(p.memory_limit, "600Mi");
    }

    #[test]
    fn default_profile_is_small() {
        let p = ResourceProfile::for_instance("psf__requests-2317");
        assert_eq!(
            p,
            ResourceProfile {
                cpu_request: "0.1".into(),
                cpu_limit: "1.2".into(),
                memory_request: "100Mi".into(),
                memory_limit: "600Mi".into(),
            }
        );
    }
}
