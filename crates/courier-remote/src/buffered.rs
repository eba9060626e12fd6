use std::sync::Arc;

use async_trait::async_trait;
use courier_transfer::{FileUpload, RemoteError, RemoteFile, UploadStrategy};

use crate::client::{FileBody, HttpDocumentService};

/// Secondary upload path: the file goes out as one contiguous multipart body
/// instead of one chunk per fragment.
pub struct BufferedUpload {
    service: Arc<HttpDocumentService>,
}

impl BufferedUpload {
    pub fn new(service: Arc<HttpDocumentService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl UploadStrategy for BufferedUpload {
    fn name(&self) -> &'static str {
        "buffered"
    }

    async fn attempt(&self, upload: &FileUpload) -> Result<RemoteFile, RemoteError> {
        self.service.upload_file(upload, FileBody::Buffered).await
    }
}
