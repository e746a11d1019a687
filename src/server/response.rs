//! Encoding of secrets into `DiscoveryResponse`s.

use crate::constants::SECRET_TYPE_URL;
use crate::resource::Resource;
use crate::secret::SecretItem;
use envoy_types::pb::envoy::config::core::v3::{data_source, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, CertificateValidationContext, Secret, TlsCertificate,
};
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use uuid::Uuid;

/// Builds a response carrying `item` under the requested resource name, with a fresh nonce.
pub(crate) fn secret_response(resource: &Resource, item: &SecretItem) -> DiscoveryResponse {
    let secret = envoy_secret(resource, item);
    DiscoveryResponse {
        version_info: item.version().to_owned(),
        resources: vec![Any {
            type_url: SECRET_TYPE_URL.to_owned(),
            value: secret.encode_to_vec().into(),
        }],
        type_url: SECRET_TYPE_URL.to_owned(),
        nonce: Uuid::new_v4().to_string(),
        ..Default::default()
    }
}

fn envoy_secret(resource: &Resource, item: &SecretItem) -> Secret {
    let kind = if resource.is_root() || item.is_root() {
        secret::Type::ValidationContext(CertificateValidationContext {
            trusted_ca: Some(inline_bytes(item.root_cert())),
            ..Default::default()
        })
    } else {
        secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(item.certificate_chain())),
            private_key: Some(inline_bytes(item.private_key().as_bytes())),
            ..Default::default()
        })
    };

    Secret {
        name: resource.name().to_owned(),
        r#type: Some(kind),
        ..Default::default()
    }
}

fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes.to_vec().into())),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(response: &DiscoveryResponse) -> Secret {
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].type_url, SECRET_TYPE_URL);
        Secret::decode(&response.resources[0].value[..]).unwrap()
    }

    fn inline(source: Option<&DataSource>) -> Vec<u8> {
        match source.and_then(|source| source.specifier.as_ref()) {
            Some(data_source::Specifier::InlineBytes(bytes)) => bytes[..].to_vec(),
            other => panic!("unexpected data source: {other:?}"),
        }
    }

    #[test]
    fn workload_certificate() {
        let item = SecretItem::new("default", "v1")
            .with_certificate_chain(vec![1])
            .with_private_key(vec![2]);
        let response = secret_response(&Resource::parse("default"), &item);

        assert_eq!(response.version_info, "v1");
        assert_eq!(response.type_url, SECRET_TYPE_URL);
        assert!(!response.nonce.is_empty());

        let secret = decode(&response);
        assert_eq!(secret.name, "default");
        match secret.r#type {
            Some(secret::Type::TlsCertificate(cert)) => {
                assert_eq!(inline(cert.certificate_chain.as_ref()), vec![1]);
                assert_eq!(inline(cert.private_key.as_ref()), vec![2]);
            }
            other => panic!("unexpected secret type: {other:?}"),
        }
    }

    #[test]
    fn root_certificate_uses_requested_name() {
        let item = SecretItem::new("ROOTCA", "v7").with_root_cert(vec![0]);
        let response = secret_response(&Resource::parse("file-root:/etc/certs/root.pem"), &item);

        let secret = decode(&response);
        assert_eq!(secret.name, "file-root:/etc/certs/root.pem");
        match secret.r#type {
            Some(secret::Type::ValidationContext(context)) => {
                assert_eq!(inline(context.trusted_ca.as_ref()), vec![0]);
            }
            other => panic!("unexpected secret type: {other:?}"),
        }
    }

    #[test]
    fn nonces_are_unique() {
        let item = SecretItem::new("ROOTCA", "v1").with_root_cert(vec![0]);
        let resource = Resource::parse("ROOTCA");
        let first = secret_response(&resource, &item);
        let second = secret_response(&resource, &item);
        assert_ne!(first.nonce, second.nonce);
    }
}
