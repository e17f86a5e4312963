//! Image resolution for templates.
//!
//! When the caller names no image, the reference of the VM we are running on
//! (from IMDS) is reused, so workers default to the master's own image.

use crate::error::{ScaleSetError, ScaleSetResult};
use crate::templates::{ensure_object_path, TemplateKind};
use azure_rest::InstanceMetadata;
use serde_json::Value;
use tracing::debug;

/// Caller-supplied image selection; all fields optional.
#[derive(Clone, Debug, Default)]
pub struct ImageSpec {
    /// Shared-image-gallery image name.
    pub sig_image_name: Option<String>,
    /// Gallery image version; only meaningful with `sig_image_name`.
    pub sig_image_version: Option<String>,
    /// Plain managed-image name; takes precedence over the gallery fields.
    pub image_name: Option<String>,
}

impl ImageSpec {
    pub fn is_empty(&self) -> bool {
        self.sig_image_name.is_none()
            && self.sig_image_version.is_none()
            && self.image_name.is_none()
    }
}

/// Fill an empty spec from the running VM's own image reference.
async fn spec_from_metadata(imds: &InstanceMetadata) -> ScaleSetResult<ImageSpec> {
    let reference = imds.image_reference().await?;
    let id = reference
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("instance image reference has no id".into()))?;

    let segments: Vec<&str> = id.split('/').collect();
    let after = |marker: &str| -> Option<String> {
        segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case(marker))
            .and_then(|i| segments.get(i + 1))
            .map(|s| s.to_string())
    };

    let spec = if segments.iter().any(|s| s.eq_ignore_ascii_case("galleries")) {
        ImageSpec {
            sig_image_name: after("images"),
            sig_image_version: after("versions"),
            image_name: None,
        }
    } else {
        ImageSpec {
            image_name: after("images"),
            ..Default::default()
        }
    };
    debug!(?spec, id, "Resolved image from instance metadata");
    Ok(spec)
}

/// Rewrite an `imageReference.id` according to the selection rules:
/// `image_name` drops the last four path segments and appends
/// `/images/<name>`; `sig_image_name` drops the last segment and appends
/// `/<name>` (+ `/versions/<version>` when given).
fn patch_image_id(id: &str, spec: &ImageSpec) -> String {
    let segments: Vec<&str> = id.split('/').collect();

    if let Some(image_name) = &spec.image_name {
        let keep = segments.len().saturating_sub(4);
        let mut id = segments[..keep].join("/");
        id.push_str(&format!("/images/{image_name}"));
        return id;
    }

    if let Some(sig_name) = &spec.sig_image_name {
        let keep = segments.len().saturating_sub(1);
        let mut id = segments[..keep].join("/");
        id.push_str(&format!("/{sig_name}"));
        if let Some(version) = &spec.sig_image_version {
            id.push_str(&format!("/versions/{version}"));
        }
        return id;
    }

    id.to_string()
}

/// Resolve the image for `template` in place.
///
/// The template must already carry an `imageReference.id` to patch; both the
/// scale-set shape and the standalone-VM shape are handled through
/// [`TemplateKind::profile_pointer`].
pub async fn resolve_image(
    template: &mut Value,
    kind: TemplateKind,
    spec: &ImageSpec,
    imds: &InstanceMetadata,
) -> ScaleSetResult<()> {
    let spec = if spec.is_empty() {
        spec_from_metadata(imds).await?
    } else {
        spec.clone()
    };

    let mut path: Vec<&str> = kind
        .profile_pointer()
        .trim_start_matches('/')
        .split('/')
        .collect();
    path.extend(["storageProfile", "imageReference"]);

    let reference = ensure_object_path(template, &path);
    let id = reference
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("template imageReference has no id".into()))?;

    let patched = patch_image_id(id, &spec);
    reference["id"] = Value::String(patched);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GALLERY_ID: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/base-image/versions/1.2.3";

    fn named(image_name: &str) -> ImageSpec {
        ImageSpec {
            image_name: Some(image_name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_patch_with_image_name_drops_four_segments() {
        let patched = patch_image_id(GALLERY_ID, &named("my-image"));
        assert_eq!(
            patched,
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/my-image"
        );
    }

    #[test]
    fn test_patch_with_sig_name_replaces_last_segment() {
        let id = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/base-image";
        let spec = ImageSpec {
            sig_image_name: Some("other-image".to_string()),
            ..Default::default()
        };
        assert_eq!(
            patch_image_id(id, &spec),
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/other-image"
        );
    }

    #[test]
    fn test_patch_with_sig_name_and_version() {
        let id = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/base-image";
        let spec = ImageSpec {
            sig_image_name: Some("other".to_string()),
            sig_image_version: Some("2.0.0".to_string()),
            image_name: None,
        };
        assert!(patch_image_id(id, &spec).ends_with("/images/other/versions/2.0.0"));
    }

    #[test]
    fn test_image_name_takes_precedence() {
        let spec = ImageSpec {
            sig_image_name: Some("sig".to_string()),
            sig_image_version: Some("9".to_string()),
            image_name: Some("plain".to_string()),
        };
        assert!(patch_image_id(GALLERY_ID, &spec).ends_with("/images/plain"));
    }

    #[tokio::test]
    async fn test_resolve_scaleset_template_with_explicit_name() {
        let mut tpl = json!({
            "properties": {"virtualMachineProfile": {"storageProfile": {"imageReference": {"id": GALLERY_ID}}}}
        });

        let imds = InstanceMetadata::new().unwrap(); // not contacted
        resolve_image(&mut tpl, TemplateKind::ScaleSet, &named("img2"), &imds)
            .await
            .unwrap();

        let id = tpl
            .pointer("/properties/virtualMachineProfile/storageProfile/imageReference/id")
            .unwrap()
            .as_str()
            .unwrap();
        assert!(id.ends_with("/images/img2"));
    }

    #[tokio::test]
    async fn test_resolve_empty_spec_queries_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/metadata/instance/compute/storageProfile/imageReference",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": GALLERY_ID})))
            .expect(1)
            .mount(&server)
            .await;

        // Template references the gallery image without a pinned version.
        let mut tpl = json!({
            "properties": {"storageProfile": {"imageReference": {
                "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/base-image"
            }}}
        });
        let imds = InstanceMetadata::new().unwrap().with_endpoint(server.uri());

        resolve_image(&mut tpl, TemplateKind::Vm, &ImageSpec::default(), &imds)
            .await
            .unwrap();

        // The metadata id is a gallery path, so the sig rules apply and the
        // running VM's exact image version is pinned.
        let id = tpl
            .pointer("/properties/storageProfile/imageReference/id")
            .unwrap()
            .as_str()
            .unwrap();
        assert!(
            id.ends_with("/galleries/gal/images/base-image/versions/1.2.3"),
            "{id}"
        );
    }

    #[tokio::test]
    async fn test_missing_id_is_a_template_error() {
        let mut tpl = json!({"properties": {}});
        let imds = InstanceMetadata::new().unwrap(); // not contacted
        let err = resolve_image(&mut tpl, TemplateKind::Vm, &named("x"), &imds)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("imageReference"));
    }
}
