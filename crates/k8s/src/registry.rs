//! Built-in Kubernetes types known to ship.
//!
//! Patches are only computed for these types; anything else (custom
//! resources, arbitrary YAML) is treated as "not a Kubernetes resource".
//! The merge keys mirror the `patchMergeKey` annotations of the upstream
//! OpenAPI schema for the fields that carry one.

use phf::{phf_map, phf_set};

use crate::resource::{CodecError, Gvk};

/// `apiVersion/Kind` of every built-in type.
static KNOWN_KINDS: phf::Set<&'static str> = phf_set! {
	"v1/Binding",
	"v1/ConfigMap",
	"v1/Endpoints",
	"v1/Event",
	"v1/LimitRange",
	"v1/List",
	"v1/Namespace",
	"v1/Node",
	"v1/PersistentVolume",
	"v1/PersistentVolumeClaim",
	"v1/Pod",
	"v1/PodTemplate",
	"v1/ReplicationController",
	"v1/ResourceQuota",
	"v1/Secret",
	"v1/Service",
	"v1/ServiceAccount",
	"admissionregistration.k8s.io/v1/MutatingWebhookConfiguration",
	"admissionregistration.k8s.io/v1/ValidatingWebhookConfiguration",
	"admissionregistration.k8s.io/v1beta1/MutatingWebhookConfiguration",
	"admissionregistration.k8s.io/v1beta1/ValidatingWebhookConfiguration",
	"apiextensions.k8s.io/v1/CustomResourceDefinition",
	"apiextensions.k8s.io/v1beta1/CustomResourceDefinition",
	"apiregistration.k8s.io/v1/APIService",
	"apps/v1/ControllerRevision",
	"apps/v1/DaemonSet",
	"apps/v1/Deployment",
	"apps/v1/ReplicaSet",
	"apps/v1/StatefulSet",
	"apps/v1beta1/Deployment",
	"apps/v1beta1/StatefulSet",
	"apps/v1beta2/DaemonSet",
	"apps/v1beta2/Deployment",
	"apps/v1beta2/ReplicaSet",
	"apps/v1beta2/StatefulSet",
	"autoscaling/v1/HorizontalPodAutoscaler",
	"autoscaling/v2/HorizontalPodAutoscaler",
	"autoscaling/v2beta1/HorizontalPodAutoscaler",
	"autoscaling/v2beta2/HorizontalPodAutoscaler",
	"batch/v1/CronJob",
	"batch/v1/Job",
	"batch/v1beta1/CronJob",
	"certificates.k8s.io/v1/CertificateSigningRequest",
	"coordination.k8s.io/v1/Lease",
	"discovery.k8s.io/v1/EndpointSlice",
	"extensions/v1beta1/DaemonSet",
	"extensions/v1beta1/Deployment",
	"extensions/v1beta1/Ingress",
	"extensions/v1beta1/NetworkPolicy",
	"extensions/v1beta1/PodSecurityPolicy",
	"extensions/v1beta1/ReplicaSet",
	"networking.k8s.io/v1/Ingress",
	"networking.k8s.io/v1/IngressClass",
	"networking.k8s.io/v1/NetworkPolicy",
	"networking.k8s.io/v1beta1/Ingress",
	"node.k8s.io/v1/RuntimeClass",
	"policy/v1/PodDisruptionBudget",
	"policy/v1beta1/PodDisruptionBudget",
	"policy/v1beta1/PodSecurityPolicy",
	"rbac.authorization.k8s.io/v1/ClusterRole",
	"rbac.authorization.k8s.io/v1/ClusterRoleBinding",
	"rbac.authorization.k8s.io/v1/Role",
	"rbac.authorization.k8s.io/v1/RoleBinding",
	"rbac.authorization.k8s.io/v1beta1/ClusterRole",
	"rbac.authorization.k8s.io/v1beta1/ClusterRoleBinding",
	"rbac.authorization.k8s.io/v1beta1/Role",
	"rbac.authorization.k8s.io/v1beta1/RoleBinding",
	"scheduling.k8s.io/v1/PriorityClass",
	"storage.k8s.io/v1/CSIDriver",
	"storage.k8s.io/v1/StorageClass",
	"storage.k8s.io/v1/VolumeAttachment",
	"storage.k8s.io/v1beta1/StorageClass",
};

/// Merge key of list fields that merge element-wise, by field name.
static FIELD_MERGE_KEYS: phf::Map<&'static str, &'static str> = phf_map! {
	"conditions" => "type",
	"containers" => "name",
	"env" => "name",
	"ephemeralContainers" => "name",
	"hostAliases" => "ip",
	"imagePullSecrets" => "name",
	"initContainers" => "name",
	"ownerReferences" => "uid",
	"readinessGates" => "conditionType",
	"topologySpreadConstraints" => "topologyKey",
	"volumeDevices" => "devicePath",
	"volumeMounts" => "mountPath",
	"volumes" => "name",
};

/// Fields whose elements are containers.
const CONTAINER_FIELDS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

pub fn is_known(gvk: &Gvk) -> bool {
	KNOWN_KINDS.contains(gvk.to_string().as_str())
}

/// Resolve a GVK against the registry.
pub fn resolve(gvk: &Gvk) -> Result<(), CodecError> {
	if is_known(gvk) {
		Ok(())
	} else {
		Err(CodecError::UnknownKind {
			api_version: gvk.api_version(),
			kind: gvk.kind.clone(),
		})
	}
}

/// Merge key for the list at `path` (map keys from the document root, list
/// indices omitted), or `None` if the list is replaced atomically.
pub fn merge_key(kind: &str, path: &[&str]) -> Option<&'static str> {
	let (&field, parents) = path.split_last()?;
	if field == "ports" {
		return match parents.last() {
			Some(parent) if CONTAINER_FIELDS.contains(parent) => Some("containerPort"),
			Some(&"spec") if kind == "Service" && parents.len() == 1 => Some("port"),
			_ => None,
		};
	}
	FIELD_MERGE_KEYS.get(field).copied()
}
