use api_client::{tables, StyleParameters};
use bytes::Bytes;
use e2e::Client;
use feed::FeedError;
use serde_json::json;

fn seed_feed(client: &Client) {
    let posts = (0..3)
        .map(|i| {
            json!({
                "id": format!("post-{}", i),
                "user_id": "u2",
                "image_url": format!("https://img/{}.png", i),
                "caption": format!("day {}", i),
                "created_at": format!("2024-03-0{}T09:00:00Z", i + 1)
            })
        })
        .collect();
    client.data.seed(tables::POSTS, posts);
    client.data.seed(
        tables::PROFILES,
        vec![
            json!({ "id": "u1", "username": "ana" }),
            json!({ "id": "u2", "username": "bo", "bio": "film only" }),
        ],
    );
}

#[tokio::test]
async fn test_publish_transformed_photo_to_feed() {
    let client = Client::signed_in("u1");
    seed_feed(&client);
    client
        .pipeline
        .process("job1", Bytes::from_static(b"raw"), &StyleParameters::default())
        .await
        .unwrap();
    let url = client.reconciler.images()[0].access_url.clone();

    assert_eq!(client.feed.load_first_page(2).await.unwrap(), 2);
    let post = client.feed.create_post(&url, Some("  styled  ")).await.unwrap();
    assert_eq!(post.post.caption.as_deref(), Some("styled"));
    assert_eq!(post.author.as_ref().unwrap().username, "ana");

    let posts = client.feed.posts();
    assert_eq!(posts[0].id(), post.id());
    assert_eq!(posts.len(), 3);

    // The new post shifted everything by one, so the next page is the last
    // seeded post and nothing repeats.
    assert_eq!(client.feed.load_next_page(2).await.unwrap(), 1);
    let ids: Vec<String> = client.feed.posts().iter().map(|p| p.id().to_string()).collect();
    assert_eq!(ids[1..], ["post-2", "post-1", "post-0"]);
    assert!(!client.feed.has_more());
}

#[tokio::test]
async fn test_like_comment_and_reload() {
    let client = Client::signed_in("u1");
    seed_feed(&client);
    client.feed.load_first_page(20).await.unwrap();

    assert!(client.feed.toggle_like("post-1").await.unwrap());
    client.feed.add_comment("post-1", "lovely light").await.unwrap();
    let post = client.feed.post("post-1").unwrap();
    assert_eq!((post.like_count, post.comment_count), (1, 1));
    assert!(post.is_liked);

    // A fresh load agrees with the optimistic state.
    client.feed.load_first_page(20).await.unwrap();
    let post = client.feed.post("post-1").unwrap();
    assert_eq!((post.like_count, post.comment_count), (1, 1));
    assert!(post.is_liked);

    let comments = client.feed.load_comments("post-1").await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author.as_ref().unwrap().username, "ana");

    assert!(!client.feed.toggle_like("post-1").await.unwrap());
    assert!(client.data.rows(tables::LIKES).is_empty());
}

#[tokio::test]
async fn test_delete_own_post_only() {
    let client = Client::signed_in("u1");
    seed_feed(&client);
    client.feed.load_first_page(20).await.unwrap();

    let err = client.feed.delete_post("post-0").await.unwrap_err();
    assert!(matches!(err, FeedError::NotFoundOrForbidden));
    assert_eq!(client.data.rows(tables::POSTS).len(), 3);

    let mine = client
        .feed
        .create_post("https://img/mine.png", None)
        .await
        .unwrap();
    client.feed.toggle_like(mine.id()).await.unwrap();
    client.feed.add_comment(mine.id(), "first").await.unwrap();

    client.feed.delete_post(mine.id()).await.unwrap();
    assert!(client.feed.post(mine.id()).is_none());
    assert_eq!(client.data.rows(tables::POSTS).len(), 3);
    assert!(client.data.rows(tables::LIKES).is_empty());
    assert!(client.data.rows(tables::COMMENTS).is_empty());
}

#[tokio::test]
async fn test_profile_counts_posts() {
    let client = Client::signed_in("u1");
    seed_feed(&client);
    let profile = client.feed.load_profile("u2").await.unwrap();
    assert_eq!(profile.username, "bo");
    assert_eq!(profile.bio.as_deref(), Some("film only"));
    assert_eq!(profile.post_count, 3);

    let err = client.feed.load_profile("nobody").await.unwrap_err();
    assert!(matches!(err, FeedError::NotFoundOrForbidden));
}
