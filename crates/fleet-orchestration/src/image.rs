//! Machine image selection
//!
//! In order of precedence: an explicit image id, the newest image named
//! `prefix*suffix`, the image family another profile's running servers
//! use, an explicit prefix given on the command line, the `base` image
//! id, and finally the full image name built from the `ami` mixin.

use crate::{
    Error, Result,
    provider::{ImageRecord, InstanceState, TagQuery},
    retry::RetryingProviderClient,
    tags,
};
use fleet_config::ConfigError;
use fleet_mixins::builtin::AmiSpec;
use std::collections::HashMap;
use tracing::info;

/// Another profile whose image family should be reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchProfile {
    /// Profile name
    pub profile: String,
    /// Fixed hostname prefix of that profile's servers
    pub hostname_prefix: String,
    /// That profile's image suffix
    pub suffix: String,
}

/// How the operator asked for the image to be chosen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRequest {
    /// Launch exactly this image
    pub image_id: Option<String>,
    /// Newest image of the family
    pub latest: bool,
    /// Family used by the `match` profile's running servers
    pub matching: Option<MatchProfile>,
    /// Prefix overriding the mixin's
    pub prefix: Option<String>,
}

/// Network and subnetwork the match lookup searches
#[derive(Debug, Clone, Copy)]
pub struct ImageScope<'a> {
    /// Network id
    pub network: &'a str,
    /// Subnetwork id
    pub subnetwork: &'a str,
}

/// Pick the image to launch from
pub async fn select_image(
    client: &RetryingProviderClient,
    spec: &AmiSpec,
    vars: &HashMap<String, String>,
    request: &ImageRequest,
    scope: ImageScope<'_>,
) -> Result<String> {
    if let Some(id) = &request.image_id {
        return Ok(id.clone());
    }

    let suffix = match &spec.suffix {
        Some(s) => Some(fleet_config::interpolate::interpolate(s, vars)?),
        None => None,
    };

    if request.latest || spec.latest {
        let prefix = spec.search_prefix(vars)?;
        let pattern = format!("{}*{}", prefix, suffix.as_deref().unwrap_or_default());
        info!("Searching for the newest image tagged {}", pattern);
        let query = TagQuery::value(&pattern);
        let query = &query;
        let images = client
            .call("describe-images", move || client.provider().describe_images(query))
            .await?;
        let newest = newest(images).ok_or_else(|| Error::NotFound(format!("image tagged {}", pattern)))?;
        info!("Selected image {} ({})", newest.id, newest.name);
        return Ok(newest.id);
    }

    if let Some(matching) = &request.matching {
        let pattern = tags::server_pattern(scope.network, scope.subnetwork, &matching.hostname_prefix);
        let query = TagQuery::value(&pattern).in_states(&[InstanceState::Running]);
        let query = &query;
        let servers = client
            .call("describe-instances", move || client.provider().describe_servers(query))
            .await?;
        let server = servers
            .first()
            .ok_or_else(|| Error::NotFound(format!("running servers of profile {}", matching.profile)))?;
        let image_id = server.image_id.as_str();
        let image = client
            .call("describe-images", move || client.provider().get_image(image_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("image {}", server.image_id)))?;
        let name = image.tags.get("Name").cloned().unwrap_or(image.name);
        let family = match name.split_once(matching.suffix.as_str()) {
            Some((family, _)) if !matching.suffix.is_empty() => family,
            _ => name.as_str(),
        };
        let wanted = format!("{}{}", family, suffix.as_deref().unwrap_or_default());
        info!("Matching {}'s image family: {}", matching.profile, wanted);
        return find_tagged(client, &wanted).await;
    }

    if let Some(prefix) = request.prefix.as_deref().filter(|p| spec.prefix.as_deref() != Some(*p)) {
        let Some(suffix) = suffix else {
            return Err(ConfigError::ValidationError(
                "ami: a suffix is required to select an image by prefix".to_string(),
            )
            .into());
        };
        return find_tagged(client, &format!("{}{}", prefix, suffix)).await;
    }

    if let Some(base) = &spec.base {
        return Ok(base.clone());
    }

    let name = spec.image_name(vars)?;
    if name.is_empty() {
        return Err(ConfigError::ValidationError(
            "ami: no image could be selected (set base, prefix/suffix or latest)".to_string(),
        )
        .into());
    }
    find_tagged(client, &name).await
}

async fn find_tagged(client: &RetryingProviderClient, value: &str) -> Result<String> {
    info!("Searching for image tagged {}", value);
    let query = TagQuery::value(value);
    let query = &query;
    let images = client
        .call("describe-images", move || client.provider().describe_images(query))
        .await?;
    images
        .into_iter()
        .next()
        .map(|i| i.id)
        .ok_or_else(|| Error::NotFound(format!("image tagged {}", value)))
}

/// Image with the greatest `created` tag; untagged images are ignored
pub fn newest(images: Vec<ImageRecord>) -> Option<ImageRecord> {
    images
        .into_iter()
        .filter_map(|i| {
            let created: i64 = i.tags.get("created")?.parse().ok()?;
            Some((created, i))
        })
        .max_by_key(|(created, _)| *created)
        .map(|(_, i)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, Tags};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    fn image(id: &str, name: &str, created: Option<i64>) -> ImageRecord {
        let mut tags = Tags::from([("Name".to_string(), name.to_string())]);
        if let Some(c) = created {
            tags.insert("created".into(), c.to_string());
        }
        ImageRecord {
            id: id.into(),
            name: name.into(),
            tags,
        }
    }

    fn scope() -> ImageScope<'static> {
        ImageScope {
            network: "ame1",
            subnetwork: "dev",
        }
    }

    #[smol_potat::test]
    async fn test_latest_picks_greatest_created() {
        let provider = Arc::new(MockProvider::new());
        provider.add_image(image("ami-1", "base-2024-hvm", Some(100)));
        provider.add_image(image("ami-2", "base-2025-hvm", Some(300)));
        provider.add_image(image("ami-3", "base-2023-hvm", None));
        let client = RetryingProviderClient::new(provider).with_policy(RetryPolicy::standard().immediate());

        let spec = AmiSpec::from_value(&json!({"prefix": "base-", "suffix": "-hvm"})).unwrap();
        let request = ImageRequest {
            latest: true,
            ..Default::default()
        };
        let id = select_image(&client, &spec, &HashMap::new(), &request, scope())
            .await
            .unwrap();
        assert_eq!(id, "ami-2");
    }

    #[smol_potat::test]
    async fn test_base_and_missing_suffix() {
        let client = RetryingProviderClient::new(Arc::new(MockProvider::new()));
        let spec = AmiSpec::from_value(&json!({"base": "ami-9"})).unwrap();
        let id = select_image(&client, &spec, &HashMap::new(), &ImageRequest::default(), scope())
            .await
            .unwrap();
        assert_eq!(id, "ami-9");

        let request = ImageRequest {
            prefix: Some("custom-".into()),
            ..Default::default()
        };
        let err = select_image(&client, &spec, &HashMap::new(), &request, scope())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
