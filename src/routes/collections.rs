//! Ordered-collection rendering
//!
//! The collection root carries `totalItems` plus `first`/`last` page
//! links; page responses carry `orderedItems` with `prev`/`next` links.
//! Page numbering follows the ascending/descending formulas of the store
//! layer: ascending first=0, descending first=⌈N/P⌉−1. A page number
//! beyond the range yields an empty page whose links still point into
//! the valid range; an invalid `page-num` parameter means the first page.

use serde_json::json;

use crate::activity::store::{last_page_num, Page, PageRequest};
use crate::activity::vocab::CONTEXT_ACTIVITY_STREAMS;
use crate::store::SortOrder;

/// Parse the `page`/`page-num` query parameters into a page request
pub fn page_request(query: Option<&str>, page_size: usize, order: SortOrder) -> Option<PageRequest> {
    let paging = super::query_param(query, "page")
        .map(|v| v == "true")
        .unwrap_or(false);

    if !paging {
        return None;
    }

    // An unparseable page number selects the first page.
    let page_num = super::query_param(query, "page-num").and_then(|v| v.parse::<i64>().ok());

    Some(PageRequest {
        page_size,
        page_num,
        order,
    })
}

fn page_id(collection_iri: &str, page_num: Option<i64>) -> String {
    let delimiter = if collection_iri.contains('?') { '&' } else { '?' };

    match page_num {
        Some(n) if n >= 0 => format!("{collection_iri}{delimiter}page=true&page-num={n}"),
        _ => format!("{collection_iri}{delimiter}page=true"),
    }
}

/// The collection root document
pub fn collection_json(
    collection_iri: &str,
    total_items: usize,
    page_size: usize,
    order: SortOrder,
) -> serde_json::Value {
    let last = last_page_num(total_items, page_size, order);

    let mut doc = json!({
        "@context": CONTEXT_ACTIVITY_STREAMS,
        "id": collection_iri,
        "type": "OrderedCollection",
        "totalItems": total_items,
        "first": page_id(collection_iri, None),
    });

    if last >= 0 {
        doc["last"] = json!(page_id(collection_iri, Some(last)));
    } else {
        doc["last"] = json!(page_id(collection_iri, None));
    }

    doc
}

/// One page of a collection; items must already be JSON values
pub fn page_json(
    collection_iri: &str,
    page: &Page<serde_json::Value>,
) -> serde_json::Value {
    let mut doc = json!({
        "@context": CONTEXT_ACTIVITY_STREAMS,
        "id": page_id(collection_iri, Some(page.current)),
        "type": "OrderedCollectionPage",
        "totalItems": page.total_items,
        "orderedItems": page.items,
    });

    if let Some(prev) = page.prev {
        doc["prev"] = json!(page_id(collection_iri, Some(prev)));
    }
    if let Some(next) = page.next {
        doc["next"] = json!(page_id(collection_iri, Some(next)));
    }

    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::store::paginate;

    const IRI: &str = "https://node1.example.com/services/anchor/inbox";

    #[test]
    fn test_page_request_parsing() {
        assert!(page_request(None, 4, SortOrder::Descending).is_none());
        assert!(page_request(Some("x=1"), 4, SortOrder::Descending).is_none());

        let req = page_request(Some("page=true&page-num=3"), 4, SortOrder::Descending).unwrap();
        assert_eq!(req.page_num, Some(3));

        // Invalid page-num falls back to the first page.
        let req = page_request(Some("page=true&page-num=abc"), 4, SortOrder::Descending).unwrap();
        assert_eq!(req.page_num, None);
    }

    // Scenario: 19 items, page size 4, descending. The root names
    // first (no explicit number) and last (page 0).
    #[test]
    fn test_collection_root_19_descending() {
        let doc = collection_json(IRI, 19, 4, SortOrder::Descending);

        assert_eq!(doc["totalItems"], 19);
        assert_eq!(doc["first"], format!("{IRI}?page=true"));
        assert_eq!(doc["last"], format!("{IRI}?page=true&page-num=0"));
    }

    #[test]
    fn test_first_page_19_descending() {
        let items: Vec<serde_json::Value> = (0..19).rev().map(|i| json!(i)).collect();
        let page = paginate(
            items,
            &PageRequest {
                page_size: 4,
                page_num: None,
                order: SortOrder::Descending,
            },
        );

        let doc = page_json(IRI, &page);
        assert_eq!(doc["orderedItems"], json!([18, 17, 16, 15]));
        assert_eq!(doc["next"], format!("{IRI}?page=true&page-num=3"));
        assert!(doc.get("prev").is_none());
        assert_eq!(doc["totalItems"], 19);
    }

    // A page number past the end: empty items, next points at the first
    // valid page, no prev.
    #[test]
    fn test_out_of_range_page_descending() {
        let items: Vec<serde_json::Value> = (0..19).rev().map(|i| json!(i)).collect();
        let page = paginate(
            items,
            &PageRequest {
                page_size: 4,
                page_num: Some(30),
                order: SortOrder::Descending,
            },
        );

        let doc = page_json(IRI, &page);
        assert_eq!(doc["orderedItems"], json!([]));
        assert_eq!(doc["next"], format!("{IRI}?page=true&page-num=4"));
        assert!(doc.get("prev").is_none());
        assert_eq!(doc["totalItems"], 19);
    }

    #[test]
    fn test_empty_collection_root() {
        let doc = collection_json(IRI, 0, 4, SortOrder::Ascending);
        assert_eq!(doc["totalItems"], 0);
        assert_eq!(doc["first"], format!("{IRI}?page=true"));
        assert_eq!(doc["last"], format!("{IRI}?page=true"));
    }
}
