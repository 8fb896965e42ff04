//! Versioned prompt templates for extraction and repair.
//!
//! Templates are deterministic (temperature 0, structured output) and carry
//! version tags so a prompt change shows up in the extraction run record.

pub const PDF_EXTRACT_TEXT_V1: &str = "pdf_extract_text_v1";
pub const PDF_EXTRACT_VISION_V1: &str = "pdf_extract_vision_v1";
pub const JSON_REPAIR_V1: &str = "json_repair_v1";

pub const TEXT_SYSTEM: &str = "\
You are an information extraction engine for B2B purchase orders.
Your job: extract a purchase order into STRICT JSON that matches the provided schema exactly.
Rules:
- Output ONLY JSON. No markdown. No explanations.
- If a field is unknown or not present, use null (do NOT invent).
- Keep original numbers as decimals. Use dot as decimal separator.
- Dates must be ISO format YYYY-MM-DD if present, else null.
- Currency must be ISO 4217. If unclear, null.
- line_no must be 1..n sequential.
- Include per-field confidence 0..1 for required fields.";

pub const VISION_SYSTEM: &str = "\
You are an information extraction engine for B2B purchase orders.
You will be given page images of a purchase order.
Extract into STRICT JSON matching the schema exactly.
Rules:
- Output ONLY JSON.
- Never invent values. Use null when unsure.
- Use ISO dates YYYY-MM-DD; currency ISO 4217.
- UoM must be one of the canonical codes if you can map it; else null.
- Provide per-field confidence 0..1.";

pub const REPAIR_SYSTEM: &str = "\
You are a JSON repair tool.
You will receive invalid JSON that was intended to match a strict schema.
Return ONLY corrected JSON that:
- Is valid JSON
- Matches the schema keys exactly
- Keeps as much original content as possible
- Does not add invented values; use null if uncertain
No explanations.";

const SCHEMA_BLOCK: &str = r#"{
  "order": {
    "external_order_number": string|null,
    "order_date": string|null,
    "currency": string|null,
    "requested_delivery_date": string|null,
    "customer_hint": { "name": string|null, "email": string|null, "erp_customer_number": string|null },
    "notes": string|null,
    "ship_to": { "company": string|null, "street": string|null, "zip": string|null, "city": string|null, "country": string|null }
  },
  "lines": [
    {
      "line_no": number,
      "customer_sku_raw": string|null,
      "product_description": string|null,
      "qty": number|null,
      "uom": string|null,
      "unit_price": number|null,
      "currency": string|null,
      "requested_delivery_date": string|null
    }
  ],
  "confidence": {
    "order": { "external_order_number": number, "order_date": number, "currency": number },
    "lines": [ { "customer_sku_raw": number, "qty": number, "uom": number, "unit_price": number } ],
    "overall": number
  },
  "warnings": [ { "code": string, "message": string } ],
  "extractor_version": "llm_v1"
}"#;

#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub from_email: Option<String>,
    pub subject: Option<String>,
    pub default_currency: String,
    pub known_customer_numbers: Vec<String>,
    pub hint_examples: Option<String>,
}

fn context_block(ctx: &PromptContext) -> String {
    format!(
        "CONTEXT (do not output, only use):\n\
         - inbound_from_email: {}\n\
         - inbound_subject: {}\n\
         - org_default_currency: {}\n\
         - canonical_uoms: ST,M,CM,MM,KG,G,L,ML,KAR,PAL,SET\n\
         - known_customer_numbers: {}\n\
         - hint_examples (optional): {}\n",
        ctx.from_email.as_deref().unwrap_or(""),
        ctx.subject.as_deref().unwrap_or(""),
        ctx.default_currency,
        ctx.known_customer_numbers.join(","),
        ctx.hint_examples.as_deref().unwrap_or(""),
    )
}

pub fn build_text_prompt(pdf_text: &str, ctx: &PromptContext) -> (String, String) {
    let user = format!(
        "{}\nTASK:\nExtract the purchase order from the text below into STRICT JSON.\n\n\
         STRICT JSON SCHEMA (keys must match exactly):\n{}\n\n\
         PURCHASE ORDER TEXT:\n<<<\n{}\n>>>",
        context_block(ctx),
        SCHEMA_BLOCK,
        pdf_text
    );
    (TEXT_SYSTEM.to_string(), user)
}

pub fn build_vision_prompt(ctx: &PromptContext) -> (String, String) {
    let user = format!(
        "{}\nTASK:\nExtract the purchase order from these page images into STRICT JSON matching \
         the schema (same as {}).\nReturn ONLY JSON.\n\n\
         STRICT JSON SCHEMA (keys must match exactly):\n{}\n\n\
         (Images attached separately by the system: page_1.png ... page_n.png)",
        context_block(ctx),
        PDF_EXTRACT_TEXT_V1,
        SCHEMA_BLOCK
    );
    (VISION_SYSTEM.to_string(), user)
}

pub fn build_repair_prompt(invalid_json: &str, validation_error: &str) -> (String, String) {
    let user = format!(
        "SCHEMA (keys must match exactly): {}\n\nINVALID JSON:\n<<<\n{}\n>>>\n\n\
         VALIDATION ERROR:\n{}\n\nReturn ONLY corrected JSON.",
        SCHEMA_BLOCK, invalid_json, validation_error
    );
    (REPAIR_SYSTEM.to_string(), user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_prompt_carries_context_and_payload() {
        let ctx = PromptContext {
            from_email: Some("buyer@acme.de".into()),
            subject: Some("Bestellung".into()),
            default_currency: "EUR".into(),
            known_customer_numbers: vec!["K-100".into(), "K-200".into()],
            hint_examples: None,
        };
        let (system, user) = build_text_prompt("Bestellnummer: PO-1", &ctx);
        assert!(system.contains("STRICT JSON"));
        assert!(user.contains("buyer@acme.de"));
        assert!(user.contains("K-100,K-200"));
        assert!(user.contains("Bestellnummer: PO-1"));
    }

    #[test]
    fn repair_prompt_includes_error() {
        let (_, user) = build_repair_prompt("{broken", "expected value at line 1");
        assert!(user.contains("{broken"));
        assert!(user.contains("expected value at line 1"));
    }
}
