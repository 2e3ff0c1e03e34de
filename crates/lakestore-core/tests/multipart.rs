mod common;

use common::{cx, temp_store};
use lakestore_core::{CompletedPart, ListOptions, StoreError};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;

async fn read_back(store: &lakestore_core::Store, bucket: &str, key: &str) -> Vec<u8> {
    let (mut reader, _) = store.bucket(bucket).open(&cx(), key, 0, 0).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_complete_orders_by_part_number() {
    let (store, dir) = temp_store();
    let bucket = store.bucket("a");
    let upload = bucket
        .create_multipart(&cx(), "m", "application/octet-stream", HashMap::new())
        .await
        .unwrap();

    // Parts arrive out of order; completion orders by number.
    upload
        .upload_part(&cx(), 2, &b"BB"[..], Some(2))
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 1, &b"AA"[..], Some(2))
        .await
        .unwrap();

    let object = upload
        .complete(
            &cx(),
            &[
                CompletedPart { number: 2, size: 2 },
                CompletedPart { number: 1, size: 2 },
            ],
        )
        .await
        .unwrap();
    assert_eq!(object.size, 4);
    assert_eq!(object.key, "m");
    assert_eq!(read_back(&store, "a", "m").await, b"AABB");

    // Staging is gone after completion.
    assert!(
        !dir.path()
            .join("a")
            .join("_multipart")
            .join(upload.id())
            .exists()
    );
}

#[tokio::test]
async fn test_part_etag_and_info() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    let part = upload
        .upload_part(&cx(), 3, &vec![0u8; 4096][..], Some(4096))
        .await
        .unwrap();
    assert_eq!(part.number, 3);
    assert_eq!(part.size, 4096);
    assert_eq!(part.etag, "3-1000");
}

#[tokio::test]
async fn test_part_number_bounds() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    for bad in [0u32, 10_001] {
        let err = upload
            .upload_part(&cx(), bad, &b"x"[..], Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "part {bad}");
    }
}

#[tokio::test]
async fn test_upload_part_without_init() {
    let (store, _dir) = temp_store();
    store.create_bucket(&cx(), "b").await.unwrap();
    let upload = store.bucket("b").multipart_upload("1234abcd-feed").unwrap();
    let err = upload
        .upload_part(&cx(), 1, &b"x"[..], Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn test_invalid_upload_id_rejected() {
    let (store, _dir) = temp_store();
    assert!(store.bucket("b").multipart_upload("../sneaky").is_err());
    assert!(store.bucket("b").multipart_upload("").is_err());
}

#[tokio::test]
async fn test_list_parts_sorted_and_paginated() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    for number in [5u32, 1, 3] {
        upload
            .upload_part(&cx(), number, &b"data"[..], Some(4))
            .await
            .unwrap();
    }
    let parts = upload.list_parts(&cx(), 0, 0).await.unwrap();
    let numbers: Vec<u32> = parts.iter().map(|p| p.number).collect();
    assert_eq!(numbers, vec![1, 3, 5]);

    let page = upload.list_parts(&cx(), 1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].number, 3);
}

#[tokio::test]
async fn test_complete_with_missing_part() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 1, &b"AA"[..], Some(2))
        .await
        .unwrap();
    let err = upload
        .complete(
            &cx(),
            &[
                CompletedPart { number: 1, size: 2 },
                CompletedPart { number: 2, size: 2 },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn test_complete_carries_metadata() {
    let (store, _dir) = temp_store();
    let mut metadata = HashMap::new();
    metadata.insert("owner".to_string(), "tests".to_string());
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "meta/obj", "text/plain", metadata)
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 1, &b"payload"[..], Some(7))
        .await
        .unwrap();
    let object = upload
        .complete(&cx(), &[CompletedPart { number: 1, size: 7 }])
        .await
        .unwrap();
    assert_eq!(object.content_type, "text/plain");
    assert_eq!(object.metadata.get("owner").map(String::as_str), Some("tests"));
}

#[tokio::test]
async fn test_abort_removes_staging_and_is_idempotent() {
    let (store, dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 1, &b"x"[..], Some(1))
        .await
        .unwrap();
    upload.abort(&cx()).await.unwrap();
    assert!(
        !dir.path()
            .join("b")
            .join("_multipart")
            .join(upload.id())
            .exists()
    );
    // Aborting an absent upload succeeds.
    upload.abort(&cx()).await.unwrap();
}

#[tokio::test]
async fn test_copy_part_unsupported() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "k", "text/plain", HashMap::new())
        .await
        .unwrap();
    let err = upload
        .copy_part(&cx(), 1, "other", "src")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unsupported));
}

#[tokio::test]
async fn test_staging_never_listed_as_objects() {
    let (store, _dir) = temp_store();
    let bucket = store.bucket("b");
    let upload = bucket
        .create_multipart(&cx(), "pending", "text/plain", HashMap::new())
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 1, &b"staged"[..], Some(6))
        .await
        .unwrap();
    bucket
        .write(
            &cx(),
            "visible.txt",
            &b"real"[..],
            Some(4),
            "text/plain",
            Default::default(),
        )
        .await
        .unwrap();

    let entries = bucket
        .list(&cx(), "", 0, 0, ListOptions::default())
        .await
        .unwrap();
    let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["visible.txt"]);

    // Listing the staging prefix directly also returns nothing.
    let entries = bucket
        .list(&cx(), "_multipart", 0, 0, ListOptions::default())
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_completed_object_served_by_read_path() {
    let (store, _dir) = temp_store();
    let upload = store
        .bucket("b")
        .create_multipart(&cx(), "nested/out.bin", "application/octet-stream", HashMap::new())
        .await
        .unwrap();
    let chunk_a: Vec<u8> = vec![1u8; 70 * 1024];
    let chunk_b: Vec<u8> = vec![2u8; 30 * 1024];
    upload
        .upload_part(&cx(), 1, &chunk_a[..], Some(chunk_a.len() as u64))
        .await
        .unwrap();
    upload
        .upload_part(&cx(), 2, &chunk_b[..], Some(chunk_b.len() as u64))
        .await
        .unwrap();
    let object = upload
        .complete(
            &cx(),
            &[
                CompletedPart {
                    number: 1,
                    size: chunk_a.len() as u64,
                },
                CompletedPart {
                    number: 2,
                    size: chunk_b.len() as u64,
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(object.size, (chunk_a.len() + chunk_b.len()) as u64);

    let back = read_back(&store, "b", "nested/out.bin").await;
    assert_eq!(&back[..chunk_a.len()], &chunk_a[..]);
    assert_eq!(&back[chunk_a.len()..], &chunk_b[..]);
}
