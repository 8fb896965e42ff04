//! End-to-end pipeline scenarios: inbound file to draft, ready gate,
//! approval, export and the ack round-trip.

use std::collections::HashMap;
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};

use orderflow_backend::ai::{scripted_json_response, ScriptedEmbedder, ScriptedLlm};
use orderflow_backend::drafts::DraftService;
use orderflow_backend::export::ack::AckPoller;
use orderflow_backend::export::crypto::ConfigCrypto;
use orderflow_backend::export::{
    create_dropzone_connection, ConnectionConfig, Exporter, FsDropzone,
};
use orderflow_backend::inbound::{Attachment, InboundMessage, InboundProcessor};
use orderflow_backend::models::{
    micros_from_f64, DocumentStatus, DraftStatus, ExportStatus, MappingStatus,
};
use orderflow_backend::objectstore::{FsObjectStore, ObjectStore};
use orderflow_backend::pipeline::Pipeline;
use orderflow_backend::store::catalog::{ProductRow, SkuMappingRow};
use orderflow_backend::store::{new_id, Db};

const CSV_ORDER: &str = "\
Bestellnummer: PO-2025-001;;;;
Datum: 2025-01-04;;;;
Währung: EUR;;;;
Pos;Artikelnummer;Bezeichnung;Menge;Einheit;E-Preis
1;ABC-123;Kabel NYM-J 3x1,5;10;M;1,23
2;DEF-456;Schalter weiss;5;Stk;4,50
3;GHI-789;Abzweigdose IP54;20;ST;0,80
";

struct Harness {
    _dir: tempfile::TempDir,
    db: Db,
    store: Arc<FsObjectStore>,
    llm: Arc<ScriptedLlm>,
    embedder: Arc<ScriptedEmbedder>,
    dropzone_dir: std::path::PathBuf,
    ack_dir: std::path::PathBuf,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme GmbH").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().join("objects")));
        let dropzone_dir = dir.path().join("dropzone/export");
        let ack_dir = dir.path().join("dropzone/ack");
        Self {
            _dir: dir,
            db,
            store,
            llm: Arc::new(ScriptedLlm::new()),
            embedder: Arc::new(ScriptedEmbedder::new(16)),
            dropzone_dir,
            ack_dir,
        }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.db.clone(),
            self.store.clone(),
            self.llm.clone(),
            Some(self.embedder.clone() as Arc<dyn orderflow_backend::ai::EmbeddingPort>),
        )
    }

    async fn seed_catalog(&self) -> String {
        let customer_id = self
            .db
            .insert_customer("t1", "Muster Maschinenbau GmbH", Some("K-100"))
            .await
            .unwrap();
        self.db
            .insert_contact("t1", &customer_id, "buyer@muster-mb.de", true)
            .await
            .unwrap();

        for (sku, name, base_uom, mapped_from) in [
            ("INT-100", "Kabel NYM-J 3x1,5", "M", "ABC123"),
            ("INT-200", "Schalter weiss", "ST", "DEF456"),
            ("INT-300", "Abzweigdose IP54", "ST", "GHI789"),
        ] {
            self.db
                .insert_product(&ProductRow {
                    id: new_id(),
                    tenant_id: "t1".into(),
                    internal_sku: sku.into(),
                    name: name.into(),
                    description: None,
                    base_uom: base_uom.into(),
                    uom_conversions: HashMap::new(),
                    attributes: HashMap::new(),
                    active: true,
                })
                .await
                .unwrap();
            self.db
                .insert_mapping(&SkuMappingRow {
                    id: new_id(),
                    tenant_id: "t1".into(),
                    customer_id: customer_id.clone(),
                    customer_sku_norm: mapped_from.into(),
                    internal_sku: sku.into(),
                    status: MappingStatus::Confirmed,
                    support_count: 2,
                    reject_count: 0,
                    uom_factor: None,
                    last_used_at: None,
                })
                .await
                .unwrap();
        }
        customer_id
    }

    async fn ingest_csv(&self) -> String {
        let processor = InboundProcessor::new(self.db.clone(), self.store.clone());
        let result = processor
            .process_message(
                "t1",
                &InboundMessage {
                    from_email: Some("buyer@muster-mb.de".into()),
                    to_email: Some("orders@acme.example".into()),
                    subject: Some("Bestellung PO-2025-001".into()),
                    attachments: vec![Attachment {
                        file_name: "bestellung.csv".into(),
                        mime_type: "text/csv".into(),
                        bytes: CSV_ORDER.as_bytes().to_vec(),
                    }],
                },
            )
            .await
            .unwrap();
        assert_eq!(result.document_ids.len(), 1);
        result.document_ids[0].clone()
    }
}

fn minimal_pdf(text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![50.into(), 700.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn vision_payload() -> serde_json::Value {
    serde_json::json!({
        "order": {
            "external_order_number": "PO-SCAN-1",
            "order_date": "2025-01-04",
            "currency": "EUR",
            "requested_delivery_date": null,
            "customer_hint": null,
            "notes": null,
            "ship_to": null
        },
        "lines": [{
            "line_no": 1,
            "customer_sku_raw": "SCAN-1",
            "product_description": "Bestellposition gescannt",
            "qty": 5.0,
            "uom": "ST",
            "unit_price": null,
            "currency": null,
            "requested_delivery_date": null
        }],
        "confidence": {
            "order": { "external_order_number": 0.8, "order_date": 0.8, "currency": 0.8 },
            "lines": [{ "customer_sku_raw": 0.8, "qty": 0.8, "uom": 0.8, "unit_price": 0.0 }],
            "overall": 0.75
        },
        "warnings": [],
        "extractor_version": "llm_v1"
    })
}

#[tokio::test]
async fn csv_order_flows_to_ready_draft() {
    let harness = Harness::new().await;
    let customer_id = harness.seed_catalog().await;
    let document_id = harness.ingest_csv().await;

    let result = harness
        .pipeline()
        .process_document("t1", &document_id)
        .await
        .unwrap();
    let draft_id = result.draft_id.expect("draft created");
    assert!(result.is_ready);

    let document = harness.db.get_document("t1", &document_id).await.unwrap().unwrap();
    assert_eq!(document.status, DocumentStatus::Extracted);

    let draft = harness.db.get_draft("t1", &draft_id).await.unwrap().unwrap();
    assert_eq!(draft.status, DraftStatus::Ready);
    assert_eq!(draft.customer_id.as_deref(), Some(customer_id.as_str()));
    assert_eq!(draft.external_order_number.as_deref(), Some("PO-2025-001"));
    assert_eq!(draft.currency.as_deref(), Some("EUR"));
    assert_eq!(draft.order_date.as_deref(), Some("2025-01-04"));

    let lines = harness.db.lines_for_draft("t1", &draft_id).await.unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].internal_sku.as_deref(), Some("INT-100"));
    assert_eq!(lines[0].uom.as_deref(), Some("M"));
    assert_eq!(lines[0].unit_price_micros, Some(micros_from_f64(1.23)));
    assert_eq!(lines[0].match_method.as_deref(), Some("exact_mapping"));
    assert!((lines[0].match_confidence.unwrap() - 0.99).abs() < 1e-9);
    assert_eq!(lines[1].internal_sku.as_deref(), Some("INT-200"));
    assert_eq!(lines[2].internal_sku.as_deref(), Some("INT-300"));

    // Rule-based extraction made no AI calls.
    assert_eq!(harness.llm.call_count(), 0);
}

#[tokio::test]
async fn missing_mapping_blocks_ready_until_confirmed() {
    let harness = Harness::new().await;
    // Customer and products exist, but no mappings: lines stay unmatched.
    let customer_id = harness
        .db
        .insert_customer("t1", "Muster Maschinenbau GmbH", Some("K-100"))
        .await
        .unwrap();
    harness
        .db
        .insert_contact("t1", &customer_id, "buyer@muster-mb.de", true)
        .await
        .unwrap();
    harness
        .db
        .insert_product(&ProductRow {
            id: new_id(),
            tenant_id: "t1".into(),
            internal_sku: "INT-100".into(),
            name: "Unbekanntes Teil".into(),
            description: None,
            base_uom: "ST".into(),
            uom_conversions: HashMap::new(),
            attributes: HashMap::new(),
            active: true,
        })
        .await
        .unwrap();

    let processor = InboundProcessor::new(harness.db.clone(), harness.store.clone());
    let csv = "Pos;Artikelnummer;Bezeichnung;Menge;Einheit\n1;ZZZ-1;Unbekanntes Teil;2;ST\n";
    let result = processor
        .process_message(
            "t1",
            &InboundMessage {
                from_email: Some("buyer@muster-mb.de".into()),
                to_email: None,
                subject: None,
                attachments: vec![Attachment {
                    file_name: "order.csv".into(),
                    mime_type: "text/csv".into(),
                    bytes: csv.as_bytes().to_vec(),
                }],
            },
        )
        .await
        .unwrap();

    let outcome = harness
        .pipeline()
        .process_document("t1", &result.document_ids[0])
        .await
        .unwrap();
    let draft_id = outcome.draft_id.unwrap();
    assert!(!outcome.is_ready);

    let draft = harness.db.get_draft("t1", &draft_id).await.unwrap().unwrap();
    assert_eq!(draft.status, DraftStatus::Matched);
    let ready: orderflow_backend::validation::ReadyCheck =
        serde_json::from_str(draft.ready_json.as_deref().unwrap()).unwrap();
    assert!(ready.blocking_reasons.contains(&"MISSING_SKU".to_string()));

    // Confirm the line; validation re-run flips the gate.
    let lines = harness.db.lines_for_draft("t1", &draft_id).await.unwrap();
    let service = DraftService::new(harness.db.clone());
    service
        .confirm_line_match("t1", &draft_id, &lines[0].id, "INT-100", "user@acme")
        .await
        .unwrap();
    let engine = orderflow_backend::validation::ValidationEngine::new(harness.db.clone());
    let run = engine.run("t1", &draft_id).await.unwrap();
    assert!(run.ready.is_ready);

    // The confirmation taught a mapping for next time.
    let mapping = harness
        .db
        .find_confirmed_mapping("t1", &customer_id, "ZZZ1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.internal_sku, "INT-100");
}

#[tokio::test]
async fn approve_export_and_ack_round_trip() {
    let harness = Harness::new().await;
    harness.seed_catalog().await;
    let document_id = harness.ingest_csv().await;
    let result = harness
        .pipeline()
        .process_document("t1", &document_id)
        .await
        .unwrap();
    let draft_id = result.draft_id.unwrap();
    assert!(result.is_ready);

    let crypto = ConfigCrypto::new("pepper");
    create_dropzone_connection(
        &harness.db,
        &crypto,
        "t1",
        &ConnectionConfig {
            mode: "filesystem".into(),
            export_path: harness.dropzone_dir.display().to_string(),
            ack_path: Some(harness.ack_dir.display().to_string()),
            atomic_write: true,
        },
    )
    .await
    .unwrap();

    // Approve at the current version.
    let draft = harness.db.get_draft("t1", &draft_id).await.unwrap().unwrap();
    let service = DraftService::new(harness.db.clone());
    let approved = service
        .approve("t1", &draft_id, draft.version, "chef@acme")
        .await
        .unwrap();
    assert_eq!(approved.status, DraftStatus::Approved);

    // Export.
    let exporter = Exporter::new(
        harness.db.clone(),
        harness.store.clone(),
        Arc::new(FsDropzone),
        ConfigCrypto::new("pepper"),
    );
    let export = exporter.export_draft("t1", &draft_id).await.unwrap();
    assert_eq!(export.status, ExportStatus::Sent);

    // Exactly one file in the dropzone, no .tmp residue, archive present.
    let files: Vec<String> = std::fs::read_dir(&harness.dropzone_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("sales_order_"));
    assert!(!files[0].ends_with(".tmp"));
    assert!(harness
        .store
        .exists(export.storage_key.as_deref().unwrap())
        .await
        .unwrap());

    let pushed = harness.db.get_draft("t1", &draft_id).await.unwrap().unwrap();
    assert_eq!(pushed.status, DraftStatus::Pushed);

    // ERP acknowledges.
    let prefix = draft_id.split('-').next().unwrap();
    let ack_name = format!("ack_sales_order_{prefix}_20250104120000_a1b2c3d4.json");
    std::fs::create_dir_all(&harness.ack_dir).unwrap();
    std::fs::write(
        harness.ack_dir.join(&ack_name),
        serde_json::json!({ "status": "ACKED", "erp_order_id": "SO-2025-000123" }).to_string(),
    )
    .unwrap();

    let poller = AckPoller::new(
        harness.db.clone(),
        Arc::new(FsDropzone),
        ConfigCrypto::new("pepper"),
    );
    let stats = poller.poll_all().await.unwrap();
    assert_eq!(stats.acks_processed, 1);

    let resolved = harness.db.get_export("t1", &export.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, ExportStatus::Acked);
    assert_eq!(resolved.erp_order_id.as_deref(), Some("SO-2025-000123"));

    let acked_draft = harness.db.get_draft("t1", &draft_id).await.unwrap().unwrap();
    assert_eq!(acked_draft.status, DraftStatus::Acked);
    assert_eq!(acked_draft.erp_order_ref.as_deref(), Some("SO-2025-000123"));

    // File moved to processed/, ack dir is clean.
    assert!(harness.ack_dir.join("processed").join(&ack_name).exists());
    assert!(!harness.ack_dir.join(&ack_name).exists());

    // Re-polling is idempotent: nothing left to process, state unchanged.
    let stats = poller.poll_all().await.unwrap();
    assert_eq!(stats.acks_processed, 0);
    let still = harness.db.get_export("t1", &export.id).await.unwrap().unwrap();
    assert_eq!(still.status, ExportStatus::Acked);
}

#[tokio::test]
async fn scanned_pdf_routes_to_vision_and_dedupes() {
    let harness = Harness::new().await;
    harness.llm.push_ok(scripted_json_response(vision_payload()));

    let pdf_bytes = minimal_pdf("Gescannte Bestellung");
    let processor = InboundProcessor::new(harness.db.clone(), harness.store.clone());

    let upload = |bytes: Vec<u8>| InboundMessage {
        from_email: Some("buyer@muster-mb.de".into()),
        to_email: None,
        subject: Some("Scan".into()),
        attachments: vec![Attachment {
            file_name: "scan.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes,
        }],
    };

    let first = processor
        .process_message("t1", &upload(pdf_bytes.clone()))
        .await
        .unwrap();
    let outcome = harness
        .pipeline()
        .process_document("t1", &first.document_ids[0])
        .await
        .unwrap();

    assert_eq!(harness.llm.call_count(), 1);
    let run = harness
        .db
        .latest_extraction_run("t1", &first.document_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.method, "llm_vision");
    assert_eq!(run.extractor_version, "llm_v1");
    assert!(run.text_coverage.unwrap() < 0.15);
    assert!(outcome.draft_id.is_some());
    let calls_after_first = harness.db.count_ai_calls("t1").await.unwrap();

    // Second identical upload: content-addressed dedup plus the run-level
    // input hash mean zero new provider calls.
    let second = processor
        .process_message("t1", &upload(pdf_bytes))
        .await
        .unwrap();
    let second_outcome = harness
        .pipeline()
        .process_document("t1", &second.document_ids[0])
        .await
        .unwrap();

    assert_eq!(harness.llm.call_count(), 1);
    assert_eq!(harness.db.count_ai_calls("t1").await.unwrap(), calls_after_first);
    assert!(second_outcome.draft_id.is_some());
}

#[tokio::test]
async fn tenant_isolation_on_drafts_and_documents() {
    let harness = Harness::new().await;
    harness.db.insert_tenant("t2", "other", "Other Corp").await.unwrap();
    harness.seed_catalog().await;
    let document_id = harness.ingest_csv().await;
    let result = harness
        .pipeline()
        .process_document("t1", &document_id)
        .await
        .unwrap();
    let draft_id = result.draft_id.unwrap();

    // A different tenant id in the query finds nothing.
    assert!(harness.db.get_draft("t2", &draft_id).await.unwrap().is_none());
    assert!(harness
        .db
        .get_document("t2", &document_id)
        .await
        .unwrap()
        .is_none());
}
