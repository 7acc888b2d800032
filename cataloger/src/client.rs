//! Contract for the remote document-management service, plus a thin
//! `reqwest`-backed implementation and an in-memory double for tests.
//!
//! The wire format here is deliberately unopinionated: callers only need
//! enough of the service's HTTP surface to drive the walker, the task
//! lifecycle and the patch builder, not a full client library.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cataloger_core::{CatalogerError, Document, DocumentMetadata, ObjectId, ObjectKind, Result, Variant};

#[derive(Debug, Clone, Default)]
pub struct ListDocumentsOptions {
    pub tag_id: ObjectId,
    pub page: u64,
    pub page_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub length: u64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: ObjectId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NamedObject {
    pub id: ObjectId,
    pub name: String,
}

/// Owner/permission fields applied uniformly to any object the resolver
/// creates. A single struct in place of reflection-driven field-builder
/// lookups: every creatable kind accepts the same shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewObject {
    pub name: String,
    pub owner: Option<ObjectId>,
    pub view_users: Vec<ObjectId>,
    pub view_groups: Vec<ObjectId>,
    pub change_users: Vec<ObjectId>,
    pub change_groups: Vec<ObjectId>,
}

/// Field-level update sent back to the service. Every field is optional:
/// absence means "leave untouched", matching the minimal-patch requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentPatchFields {
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub created: Option<time::OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correspondent: Option<Option<ObjectId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<Option<ObjectId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<Option<ObjectId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<ObjectId>>,
}

impl DocumentPatchFields {
    pub fn is_empty(&self) -> bool {
        self == &DocumentPatchFields::default()
    }
}

#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn list_documents(&self, opts: ListDocumentsOptions) -> Result<DocumentPage>;
    async fn get_document(&self, id: ObjectId) -> Result<Document>;
    async fn get_document_metadata(&self, id: ObjectId) -> Result<DocumentMetadata>;
    async fn patch_document(&self, id: ObjectId, fields: &DocumentPatchFields) -> Result<()>;
    async fn download_document(&self, id: ObjectId, variant: Variant, dest_path: &std::path::Path) -> Result<DownloadInfo>;
    async fn get_current_user(&self) -> Result<User>;
    async fn list_objects(&self, kind: ObjectKind, name: &str) -> Result<Vec<NamedObject>>;
    async fn create_object(&self, kind: ObjectKind, fields: &NewObject) -> Result<ObjectId>;
}

/// Base-URL + bearer-token `reqwest` client. Network errors and non-2xx
/// responses both surface as [`CatalogerError::RemoteHttp`] so `is_permanent`
/// can key off the status code alone.
pub struct ReqwestDocumentClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReqwestDocumentClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(CatalogerError::RemoteHttp {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DocumentClient for ReqwestDocumentClient {
    async fn list_documents(&self, opts: ListDocumentsOptions) -> Result<DocumentPage> {
        let resp = self
            .http
            .get(self.url("api/documents/"))
            .bearer_auth(&self.token)
            .query(&[
                ("tags__id__in", opts.tag_id.to_string()),
                ("ordering", "id".to_string()),
                ("page", opts.page.to_string()),
                ("page_size", opts.page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<DocumentPage>()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))
    }

    async fn get_document(&self, id: ObjectId) -> Result<Document> {
        let resp = self
            .http
            .get(self.url(&format!("api/documents/{id}/")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<Document>().await.map_err(|e| CatalogerError::Other(e.to_string()))
    }

    async fn get_document_metadata(&self, id: ObjectId) -> Result<DocumentMetadata> {
        let resp = self
            .http
            .get(self.url(&format!("api/documents/{id}/metadata/")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<DocumentMetadata>()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))
    }

    async fn patch_document(&self, id: ObjectId, fields: &DocumentPatchFields) -> Result<()> {
        let resp = self
            .http
            .patch(self.url(&format!("api/documents/{id}/")))
            .bearer_auth(&self.token)
            .json(fields)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn download_document(&self, id: ObjectId, variant: Variant, dest_path: &std::path::Path) -> Result<DownloadInfo> {
        let segment = match variant {
            Variant::Archived => "download/?original=false",
            Variant::Original => "download/?original=true",
        };
        let resp = self
            .http
            .get(self.url(&format!("api/documents/{id}/{segment}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        let filename = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{id}.bin"));
        let bytes = resp.bytes().await.map_err(|e| CatalogerError::Other(e.to_string()))?;
        tokio::fs::write(dest_path, &bytes).await?;
        Ok(DownloadInfo {
            length: bytes.len() as u64,
            filename,
        })
    }

    async fn get_current_user(&self) -> Result<User> {
        let resp = self
            .http
            .get(self.url("api/ui_settings/"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<User>().await.map_err(|e| CatalogerError::Other(e.to_string()))
    }

    async fn list_objects(&self, kind: ObjectKind, name: &str) -> Result<Vec<NamedObject>> {
        let resp = self
            .http
            .get(self.url(&format!("api/{}/", plural(kind))))
            .bearer_auth(&self.token)
            .query(&[("name__iexact", name)])
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<Vec<NamedObject>>()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))
    }

    async fn create_object(&self, kind: ObjectKind, fields: &NewObject) -> Result<ObjectId> {
        if !kind.create_supported() {
            return Err(CatalogerError::CreateUnsupported);
        }
        let resp = self
            .http
            .post(self.url(&format!("api/{}/", plural(kind))))
            .bearer_auth(&self.token)
            .json(fields)
            .send()
            .await
            .map_err(|e| CatalogerError::Other(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        let created: NamedObject = resp.json().await.map_err(|e| CatalogerError::Other(e.to_string()))?;
        Ok(created.id)
    }
}

fn plural(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Tag => "tags",
        ObjectKind::Correspondent => "correspondents",
        ObjectKind::DocumentType => "document_types",
        ObjectKind::StoragePath => "storage_paths",
        ObjectKind::User => "users",
        ObjectKind::Group => "groups",
    }
}

impl Serialize for DocumentPage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            results: &'a [Document],
            next: Option<&'a str>,
        }
        Wire {
            results: &self.documents,
            next: if self.has_more { Some("") } else { None },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentPage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            results: Vec<Document>,
            next: Option<String>,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(DocumentPage {
            documents: wire.results,
            has_more: wire.next.is_some(),
        })
    }
}

impl Serialize for User {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: ObjectId,
            username: &'a str,
        }
        Wire {
            id: self.id,
            username: &self.name,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for User {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            id: ObjectId,
            username: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(User {
            id: wire.id,
            name: wire.username,
        })
    }
}

impl Serialize for NamedObject {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: ObjectId,
            name: &'a str,
        }
        Wire {
            id: self.id,
            name: &self.name,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NamedObject {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            id: ObjectId,
            name: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(NamedObject { id: wire.id, name: wire.name })
    }
}

/// In-process double used throughout the engine's own test suite and
/// available to downstream integration tests.
#[derive(Default)]
pub struct MemoryDocumentClient {
    pub documents: Mutex<BTreeMap<ObjectId, Document>>,
    pub metadata: Mutex<BTreeMap<ObjectId, DocumentMetadata>>,
    pub objects: Mutex<BTreeMap<ObjectKind, Vec<NamedObject>>>,
    next_object_id: AtomicI64,
    pub patches: Mutex<Vec<(ObjectId, DocumentPatchFields)>>,
    pub create_calls: Mutex<Vec<(ObjectKind, String)>>,
}

impl MemoryDocumentClient {
    pub fn new() -> Self {
        Self {
            next_object_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    pub fn insert_document(&self, doc: Document, meta: DocumentMetadata) {
        let id = doc.id;
        self.documents.lock().unwrap().insert(id, doc);
        self.metadata.lock().unwrap().insert(id, meta);
    }
}

#[async_trait]
impl DocumentClient for MemoryDocumentClient {
    async fn list_documents(&self, opts: ListDocumentsOptions) -> Result<DocumentPage> {
        let docs = self.documents.lock().unwrap();
        let mut matching: Vec<Document> = docs
            .values()
            .filter(|d| d.tags.contains(&opts.tag_id))
            .cloned()
            .collect();
        matching.sort_by_key(|d| d.id);
        Ok(DocumentPage {
            documents: matching,
            has_more: false,
        })
    }

    async fn get_document(&self, id: ObjectId) -> Result<Document> {
        self.documents
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CatalogerError::NotFound)
    }

    async fn get_document_metadata(&self, id: ObjectId) -> Result<DocumentMetadata> {
        self.metadata.lock().unwrap().get(&id).cloned().ok_or(CatalogerError::NotFound)
    }

    async fn patch_document(&self, id: ObjectId, fields: &DocumentPatchFields) -> Result<()> {
        let mut docs = self.documents.lock().unwrap();
        let doc = docs.get_mut(&id).ok_or(CatalogerError::NotFound)?;
        if let Some(created) = fields.created {
            doc.created = Some(created);
        }
        if let Some(title) = &fields.title {
            doc.title = title.clone();
        }
        if let Some(c) = fields.correspondent {
            doc.correspondent = c;
        }
        if let Some(dt) = fields.document_type {
            doc.document_type = dt;
        }
        if let Some(sp) = fields.storage_path {
            doc.storage_path = sp;
        }
        if let Some(tags) = &fields.tags {
            doc.tags = tags.iter().copied().collect();
        }
        self.patches.lock().unwrap().push((id, fields.clone()));
        Ok(())
    }

    async fn download_document(&self, id: ObjectId, _variant: Variant, dest_path: &std::path::Path) -> Result<DownloadInfo> {
        let doc = self.get_document(id).await?;
        tokio::fs::write(dest_path, doc.content.as_bytes()).await?;
        Ok(DownloadInfo {
            length: doc.content.len() as u64,
            filename: format!("{id}.txt"),
        })
    }

    async fn get_current_user(&self) -> Result<User> {
        Ok(User { id: 1, name: "cataloger".to_string() })
    }

    async fn list_objects(&self, kind: ObjectKind, name: &str) -> Result<Vec<NamedObject>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&kind)
            .map(|v| v.iter().filter(|o| o.name.eq_ignore_ascii_case(name)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create_object(&self, kind: ObjectKind, fields: &NewObject) -> Result<ObjectId> {
        if !kind.create_supported() {
            return Err(CatalogerError::CreateUnsupported);
        }
        self.create_calls.lock().unwrap().push((kind, fields.name.clone()));
        let id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(NamedObject { id, name: fields.name.clone() });
        Ok(id)
    }
}
