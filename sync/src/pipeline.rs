use crate::image_loader::ImageLoader;
use crate::jobs::InFlightJobTracker;
use crate::reconciler::GalleryReconciler;
use api_client::{
    encode_row, tables, ApiClientError, Filter, GalleryRecord, ImageSource, Query,
    RemoteDataStore, RemoteObjectStore, StyleParameters, TransformApi, GALLERY_BUCKET,
};
use auth::AuthContext;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Not signed in")]
    Unauthenticated,
    #[error("Transform failed: {0}")]
    Transform(ApiClientError),
    #[error("Downloading the result failed: {0}")]
    Download(ApiClientError),
    #[error("Upload failed: {0}")]
    Upload(ApiClientError),
    #[error("Saving the gallery record failed: {0}")]
    Record(ApiClientError),
    #[error("Photo not found or not owned by the current user")]
    NotFoundOrForbidden,
    #[error("Backend Error: {0}")]
    Remote(ApiClientError),
}

/// Drives one captured photo from transformation to the gallery: submit,
/// download the result, upload it, record it, then reconcile the gallery.
pub struct TransformPipeline {
    transform: Arc<dyn TransformApi>,
    images: Arc<dyn ImageSource>,
    data: Arc<dyn RemoteDataStore>,
    objects: Arc<dyn RemoteObjectStore>,
    auth: Arc<dyn AuthContext>,
    tracker: InFlightJobTracker,
    reconciler: Arc<GalleryReconciler>,
    loader: Option<ImageLoader>,
}

impl TransformPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transform: Arc<dyn TransformApi>,
        images: Arc<dyn ImageSource>,
        data: Arc<dyn RemoteDataStore>,
        objects: Arc<dyn RemoteObjectStore>,
        auth: Arc<dyn AuthContext>,
        tracker: InFlightJobTracker,
        reconciler: Arc<GalleryReconciler>,
    ) -> Self {
        TransformPipeline {
            transform,
            images,
            data,
            objects,
            auth,
            tracker,
            reconciler,
            loader: None,
        }
    }

    /// Invalidate cached images of deleted photos through `loader`.
    pub fn with_image_loader(mut self, loader: ImageLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn tracker(&self) -> &InFlightJobTracker {
        &self.tracker
    }

    pub fn reconciler(&self) -> &Arc<GalleryReconciler> {
        &self.reconciler
    }

    /// Transform `image` and add the result to the signed-in user's gallery.
    ///
    /// Fails fast without touching the tracker when nobody is signed in. Every
    /// other failure is reported through the tracker as an error notification,
    /// and so is dropping the future before it completes.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, image, style)))]
    pub async fn process(
        &self,
        job_id: &str,
        image: Bytes,
        style: &StyleParameters,
    ) -> Result<GalleryRecord, PipelineError> {
        let user_id = self
            .auth
            .require_user()
            .map_err(|_| PipelineError::Unauthenticated)?;
        let start = Instant::now();
        let job = self.tracker.track(job_id);

        match self.run(&user_id, job_id, image, style).await {
            Ok(record) => {
                job.succeed();
                tracing::info!(
                    "transform_time_ms" = %start.elapsed().as_millis(),
                    job_id,
                    path = %record.identity_path,
                    "Photo transformed"
                );
                let outcome = self.reconciler.refresh(&user_id).await;
                tracing::debug!(?outcome, "Gallery refreshed after transform");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Transform pipeline failed");
                job.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        user_id: &str,
        job_id: &str,
        image: Bytes,
        style: &StyleParameters,
    ) -> Result<GalleryRecord, PipelineError> {
        let result_url = self
            .transform
            .submit(image, style)
            .await
            .map_err(PipelineError::Transform)?;
        let bytes = self
            .images
            .fetch(&result_url)
            .await
            .map_err(PipelineError::Download)?;

        let path = format!("{}/{}.png", user_id, job_id);
        self.objects
            .upload(GALLERY_BUCKET, &path, bytes, "image/png")
            .await
            .map_err(PipelineError::Upload)?;

        let record = GalleryRecord {
            user_id: user_id.to_string(),
            identity_path: path.clone(),
            title: None,
            description: None,
            created_at: Utc::now(),
            access_url: None,
        };
        let inserted = match encode_row(&record) {
            Ok(row) => self.data.insert(tables::GALLERY, row).await,
            Err(e) => Err(e),
        };
        if let Err(e) = inserted {
            // Without its row the object would never show up anywhere.
            if let Err(remove_err) = self.objects.remove(GALLERY_BUCKET, &[path]).await {
                tracing::warn!(error = %remove_err, "Failed to remove orphaned upload");
            }
            return Err(PipelineError::Record(e));
        }
        Ok(record)
    }

    /// Run [`process`](Self::process) in the background.
    pub fn spawn(
        self: Arc<Self>,
        job_id: String,
        image: Bytes,
        style: StyleParameters,
    ) -> JoinHandle<Result<GalleryRecord, PipelineError>> {
        tokio::spawn(async move { self.process(&job_id, image, &style).await })
    }

    /// Delete a photo of the signed-in user.
    ///
    /// Ownership is checked before anything is removed; the row goes first and
    /// the stored object after it.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn delete_photo(&self, identity_path: &str) -> Result<(), PipelineError> {
        let user_id = self
            .auth
            .require_user()
            .map_err(|_| PipelineError::Unauthenticated)?;
        let filters = [
            Filter::eq("storage_path", identity_path),
            Filter::eq("user_id", user_id.as_str()),
        ];
        let query = Query::new()
            .eq("storage_path", identity_path)
            .eq("user_id", user_id.as_str())
            .limit(1);
        let owned = self
            .data
            .query(tables::GALLERY, &query)
            .await
            .map_err(PipelineError::Remote)?;
        if owned.is_empty() {
            return Err(PipelineError::NotFoundOrForbidden);
        }

        self.data
            .delete(tables::GALLERY, &filters)
            .await
            .map_err(PipelineError::Remote)?;
        if let Err(e) = self
            .objects
            .remove(GALLERY_BUCKET, &[identity_path.to_string()])
            .await
        {
            tracing::warn!(error = %e, path = identity_path, "Stored object not removed");
        }
        if let Some(loader) = &self.loader {
            loader.invalidate(identity_path);
        }
        tracing::info!(path = identity_path, "Photo deleted");
        self.reconciler.refresh(&user_id).await;
        Ok(())
    }
}
