use futures_util::future::BoxFuture;
use notemirror_core::{ApiError, ApiErrorClass, Block, NodeClient};
use tracing::warn;

/// One lightweight retry for child-block listings that fail transiently.
/// Anything else propagates immediately.
pub(crate) async fn list_blocks_with_retry(
    client: &NodeClient,
    id: &str,
) -> Result<Vec<Block>, ApiError> {
    match client.list_child_blocks_all(id).await {
        Ok(blocks) => Ok(blocks),
        Err(err)
            if matches!(
                err.class(),
                ApiErrorClass::Transient | ApiErrorClass::RateLimit
            ) =>
        {
            warn!(node = id, error = %err, "child block listing failed, retrying once");
            client.list_child_blocks_all(id).await
        }
        Err(err) => Err(err),
    }
}

/// Fetch a node's complete block tree: nested blocks are inlined recursively,
/// child-page boundaries are left as leaves for the coordinator to dispatch.
pub(crate) async fn fetch_blocks_deep(
    client: &NodeClient,
    id: &str,
) -> Result<Vec<Block>, ApiError> {
    let mut blocks = list_blocks_with_retry(client, id).await?;
    fill_nested(client, &mut blocks).await?;
    Ok(blocks)
}

fn fill_nested<'a>(
    client: &'a NodeClient,
    blocks: &'a mut [Block],
) -> BoxFuture<'a, Result<(), ApiError>> {
    Box::pin(async move {
        for block in blocks {
            if block.has_children && !block.is_child_page() {
                block.children = list_blocks_with_retry(client, &block.id).await?;
                fill_nested(client, &mut block.children).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn inlines_nested_blocks_but_not_child_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/page1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "id": "b1", "type": "toggle", "has_children": true, "toggle": {} },
                    { "id": "c1", "type": "child_page", "has_children": true,
                      "child_page": { "title": "Sub" } }
                ],
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/b1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "id": "b2", "type": "paragraph", "paragraph": {} }
                ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        let blocks = fetch_blocks_deep(&client, "page1").await.unwrap();

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].children.len(), 1);
        assert_eq!(blocks[0].children[0].id, "b2");
        // The child-page boundary stays a leaf; no fetch for c1's children.
        assert!(blocks[1].children.is_empty());
        let requests = server.received_requests().await.unwrap();
        assert!(
            !requests
                .iter()
                .any(|req| req.url.path().contains("/v1/nodes/c1/"))
        );
    }

    #[tokio::test]
    async fn retries_listing_once_on_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/page1/children"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/page1/children"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [ { "id": "b1", "type": "paragraph", "paragraph": {} } ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        let blocks = list_blocks_with_retry(&client, "page1").await.unwrap();
        assert_eq!(blocks.len(), 1);
    }

    #[tokio::test]
    async fn permanent_listing_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/page1/children"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = NodeClient::with_base_url(&server.uri(), "t").unwrap();
        assert!(list_blocks_with_retry(&client, "page1").await.is_err());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
