//! YouTube Data API listings used to enrich the revenue reports.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use ytr_core::{Channel, Video, VideoCategory};
use ytr_storage::{retry_with_backoff, BackoffPolicy, HttpFetcher};

use crate::{ApiHandle, MetadataApi, Page, PageCursor, RemoteApiError};

/// The Data API rejects `id` filters and page sizes above this.
pub const MAX_IDS_PER_REQUEST: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Item<S> {
    id: String,
    snippet: S,
}

#[derive(Debug, Deserialize)]
struct TitleSnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    category_id: String,
}

#[derive(Debug, Clone)]
pub struct YouTubeDataClient {
    handle: ApiHandle,
    http: Arc<HttpFetcher>,
}

impl YouTubeDataClient {
    pub fn new(handle: ApiHandle, http: Arc<HttpFetcher>) -> Self {
        Self { handle, http }
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<ListResponse<T>, RemoteApiError> {
        let url = format!("{}{}", self.handle.base_url, resource);
        Ok(self
            .http
            .get_json(&self.handle.service_name, &url, params, &self.handle.access_token)
            .await?)
    }
}

#[async_trait]
impl MetadataApi for YouTubeDataClient {
    async fn list_channels_page(
        &self,
        content_owner_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<Channel>, RemoteApiError> {
        let mut params = vec![
            ("part", "snippet".to_string()),
            ("managedByMe", "true".to_string()),
            ("maxResults", MAX_IDS_PER_REQUEST.to_string()),
            ("onBehalfOfContentOwner", content_owner_id.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let response: ListResponse<Item<TitleSnippet>> = self.get("channels", &params).await?;
        Ok(Page {
            items: response
                .items
                .into_iter()
                .map(|item| Channel {
                    id: item.id,
                    name: item.snippet.title,
                })
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn list_videos(
        &self,
        content_owner_id: &str,
        ids: &[String],
    ) -> Result<Vec<Video>, RemoteApiError> {
        let params = [
            ("part", "snippet".to_string()),
            ("id", ids.join(",")),
            ("onBehalfOfContentOwner", content_owner_id.to_string()),
        ];
        let response: ListResponse<Item<VideoSnippet>> = self.get("videos", &params).await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| Video {
                id: item.id,
                name: clean_title(&item.snippet.title),
                category_id: item.snippet.category_id,
            })
            .collect())
    }

    async fn list_categories(&self, ids: &[String]) -> Result<Vec<VideoCategory>, RemoteApiError> {
        let params = [("part", "snippet".to_string()), ("id", ids.join(","))];
        let response: ListResponse<Item<TitleSnippet>> = self.get("videoCategories", &params).await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| VideoCategory {
                id: item.id,
                name: item.snippet.title,
            })
            .collect())
    }
}

/// Titles are loaded into single-line warehouse cells.
fn clean_title(title: &str) -> String {
    title.replace(['\n', '\r'], "")
}

/// All channels managed by the content owner, across every page.
pub async fn list_all_channels(
    api: &dyn MetadataApi,
    content_owner_id: &str,
    backoff: &BackoffPolicy,
) -> Result<Vec<Channel>, RemoteApiError> {
    info!("started listing channels");
    let mut channels = Vec::new();
    let mut cursor = PageCursor::new("channels.list");
    loop {
        let token = cursor.token();
        let page = retry_with_backoff(backoff, RemoteApiError::is_retryable, |_| async move {
            api.list_channels_page(content_owner_id, token).await
        })
        .await?;
        channels.extend(page.items);
        if !cursor.advance(page.next_page_token)? {
            break;
        }
    }
    info!(channels = channels.len(), "channels listed");
    Ok(channels)
}

/// Looks up videos [`MAX_IDS_PER_REQUEST`] ids at a time.
pub async fn list_videos_in_batches(
    api: &dyn MetadataApi,
    content_owner_id: &str,
    ids: &[String],
    backoff: &BackoffPolicy,
) -> Result<Vec<Video>, RemoteApiError> {
    let total = ids.len();
    info!(total, "started listing videos");
    let mut videos = Vec::with_capacity(total);
    for (batch_no, batch) in ids.chunks(MAX_IDS_PER_REQUEST).enumerate() {
        let done = (batch_no * MAX_IDS_PER_REQUEST + batch.len()).min(total);
        info!(
            from = batch_no * MAX_IDS_PER_REQUEST,
            to = done,
            total,
            progress = format!("{:.2}%", 100.0 * done as f64 / total as f64),
            "listing video batch"
        );
        let found = retry_with_backoff(backoff, RemoteApiError::is_retryable, |_| {
            api.list_videos(content_owner_id, batch)
        })
        .await?;
        videos.extend(found);
    }
    info!(videos = videos.len(), "videos listed");
    Ok(videos)
}

/// Categories referenced by `videos`, looked up once per distinct id.
pub async fn list_categories_for(
    api: &dyn MetadataApi,
    videos: &[Video],
    backoff: &BackoffPolicy,
) -> Result<Vec<VideoCategory>, RemoteApiError> {
    let ids: Vec<String> = videos
        .iter()
        .map(|v| v.category_id.clone())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut categories = Vec::new();
    for batch in ids.chunks(MAX_IDS_PER_REQUEST) {
        let found = retry_with_backoff(backoff, RemoteApiError::is_retryable, |_| {
            api.list_categories(batch)
        })
        .await?;
        categories.extend(found);
    }
    info!(categories = categories.len(), "video categories listed");
    Ok(categories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use ytr_storage::FetchError;

    #[derive(Default)]
    struct FakeDataApi {
        video_batches: Mutex<Vec<usize>>,
        category_calls: Mutex<Vec<Vec<String>>>,
        channel_failures_left: Mutex<usize>,
        cyclic_channel_pages: bool,
    }

    #[async_trait]
    impl MetadataApi for FakeDataApi {
        async fn list_channels_page(
            &self,
            _owner: &str,
            page_token: Option<&str>,
        ) -> Result<Page<Channel>, RemoteApiError> {
            {
                let mut left = self.channel_failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(RemoteApiError::Fetch(FetchError::HttpStatus {
                        status: 503,
                        url: "channels".into(),
                        body: String::new(),
                    }));
                }
            }
            let (id, next) = match page_token {
                None => ("UC1", Some("p2".to_string())),
                Some("p2") if self.cyclic_channel_pages => ("UC2", Some("p3".to_string())),
                Some(_) if self.cyclic_channel_pages => ("UC3", Some("p2".to_string())),
                Some(_) => ("UC2", None),
            };
            Ok(Page {
                items: vec![Channel {
                    id: id.into(),
                    name: format!("channel {id}"),
                }],
                next_page_token: next,
            })
        }

        async fn list_videos(&self, _owner: &str, ids: &[String]) -> Result<Vec<Video>, RemoteApiError> {
            self.video_batches.lock().unwrap().push(ids.len());
            Ok(ids
                .iter()
                .map(|id| Video {
                    id: id.clone(),
                    name: id.clone(),
                    category_id: if id.ends_with('0') { "10".into() } else { "22".into() },
                })
                .collect())
        }

        async fn list_categories(&self, ids: &[String]) -> Result<Vec<VideoCategory>, RemoteApiError> {
            self.category_calls.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .map(|id| VideoCategory {
                    id: id.clone(),
                    name: format!("category {id}"),
                })
                .collect())
        }
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn channels_follow_pages_and_retry_transient_errors() {
        let api = FakeDataApi {
            channel_failures_left: Mutex::new(1),
            ..Default::default()
        };
        let channels = list_all_channels(&api, "owner", &quick_backoff()).await.unwrap();
        let ids: Vec<_> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["UC1", "UC2"]);
    }

    #[tokio::test]
    async fn channel_page_cycle_is_a_protocol_error() {
        let api = FakeDataApi {
            cyclic_channel_pages: true,
            ..Default::default()
        };
        let err = list_all_channels(&api, "owner", &quick_backoff()).await.unwrap_err();
        assert!(matches!(err, RemoteApiError::Protocol { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn videos_are_requested_in_batches_of_fifty() {
        let api = FakeDataApi::default();
        let ids: Vec<String> = (0..120).map(|i| format!("v{i}")).collect();
        let videos = list_videos_in_batches(&api, "owner", &ids, &quick_backoff())
            .await
            .unwrap();
        assert_eq!(videos.len(), 120);
        assert_eq!(*api.video_batches.lock().unwrap(), vec![50, 50, 20]);

        let categories = list_categories_for(&api, &videos, &quick_backoff()).await.unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(
            *api.category_calls.lock().unwrap(),
            vec![vec!["10".to_string(), "22".to_string()]]
        );
    }

    #[test]
    fn video_titles_lose_line_breaks() {
        assert_eq!(clean_title("Top\nclip\r\n"), "Topclip");
    }
}
