//! Lexical term-matching adapter over a tantivy index
//!
//! Boosted multi-field BM25 matching: title, section, and body fields with
//! configurable per-field weights. The index is populated by the ingestion
//! pipeline through `LexicalIndexBuilder`; the adapter only searches.

use crate::corpus::RetrievalUnit;
use crate::query::Query;
use crate::retriever::{sort_candidates, AdapterError, Candidate, RetrieverAdapter, BACKEND_LEXICAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Term, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};

/// Per-field boost weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldBoosts {
    pub title: f32,
    pub section: f32,
    pub body: f32,
}

impl Default for FieldBoosts {
    fn default() -> Self {
        Self {
            title: 2.0,
            section: 1.5,
            body: 1.0,
        }
    }
}

struct LexicalFields {
    id: Field,
    facet: Field,
    source: Field,
    title: Field,
    section: Field,
    body: Field,
}

fn build_schema() -> (Schema, LexicalFields) {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    let facet = builder.add_text_field("facet", STRING);
    let source = builder.add_text_field("source", STRING);
    let title = builder.add_text_field("title", TEXT);
    let section = builder.add_text_field("section", TEXT);
    let body = builder.add_text_field("body", TEXT | STORED);
    let schema = builder.build();
    (
        schema,
        LexicalFields {
            id,
            facet,
            source,
            title,
            section,
            body,
        },
    )
}

fn resolve_fields(schema: &Schema) -> Result<LexicalFields, AdapterError> {
    let field = |name: &str| {
        schema
            .get_field(name)
            .map_err(|_| AdapterError::Index(format!("Missing '{}' field in schema", name)))
    };
    Ok(LexicalFields {
        id: field("id")?,
        facet: field("facet")?,
        source: field("source")?,
        title: field("title")?,
        section: field("section")?,
        body: field("body")?,
    })
}

/// Write-side companion used by the ingestion boundary and test fixtures
pub struct LexicalIndexBuilder {
    writer: IndexWriter,
    fields: LexicalFields,
}

impl LexicalIndexBuilder {
    /// Create a fresh index directory
    pub fn create(index_path: &Path) -> Result<Self, AdapterError> {
        std::fs::create_dir_all(index_path)
            .map_err(|e| AdapterError::Index(format!("Failed to create index dir: {}", e)))?;
        let (schema, fields) = build_schema();
        let index = Index::create_in_dir(index_path, schema)
            .map_err(|e| AdapterError::Index(e.to_string()))?;
        let writer = index
            .writer(50_000_000)
            .map_err(|e| AdapterError::Index(e.to_string()))?;
        Ok(Self { writer, fields })
    }

    /// Index one unit; title and source come from unit metadata
    pub fn add_unit(&mut self, unit: &RetrievalUnit) -> Result<(), AdapterError> {
        let title = unit
            .metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let source = unit
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let section = unit.section.as_deref().unwrap_or_default();

        self.writer
            .add_document(doc!(
                self.fields.id => unit.id.as_str(),
                self.fields.facet => unit.facet.as_str(),
                self.fields.source => source,
                self.fields.title => title,
                self.fields.section => section,
                self.fields.body => unit.text.as_str(),
            ))
            .map_err(|e| AdapterError::Index(e.to_string()))?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), AdapterError> {
        self.writer
            .commit()
            .map_err(|e| AdapterError::Index(e.to_string()))?;
        Ok(())
    }
}

/// Read-side adapter
pub struct LexicalAdapter {
    index: Index,
    reader: IndexReader,
    fields: LexicalFields,
    boosts: FieldBoosts,
}

impl LexicalAdapter {
    /// Open an existing index directory
    pub fn open(index_path: &Path, boosts: FieldBoosts) -> Result<Self, AdapterError> {
        let index = Index::open_in_dir(index_path)
            .map_err(|e| AdapterError::Index(e.to_string()))?;
        let fields = resolve_fields(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| AdapterError::Index(e.to_string()))?;
        Ok(Self {
            index,
            reader,
            fields,
            boosts,
        })
    }

    /// Assemble the parser input from canonical text, operators, expansions
    fn query_text(query: &Query) -> String {
        let mut parts: Vec<String> = Vec::new();
        for phrase in &query.must_terms {
            parts.push(format!("+\"{}\"", phrase));
        }
        if !query.canonical.is_empty() {
            parts.push(query.canonical.clone());
        }
        for term in &query.expansion_terms {
            parts.push(term.clone());
        }
        for term in &query.negative_terms {
            parts.push(format!("-{}", term));
        }
        parts.join(" ")
    }
}

#[async_trait]
impl RetrieverAdapter for LexicalAdapter {
    fn name(&self) -> &str {
        BACKEND_LEXICAL
    }

    async fn search(&self, query: &Query, top_k: usize) -> Result<Vec<Candidate>, AdapterError> {
        let searcher = self.reader.searcher();

        let mut parser = QueryParser::for_index(
            &self.index,
            vec![self.fields.title, self.fields.section, self.fields.body],
        );
        parser.set_field_boost(self.fields.title, self.boosts.title);
        parser.set_field_boost(self.fields.section, self.boosts.section);
        parser.set_field_boost(self.fields.body, self.boosts.body);

        // Lenient parse: user text must not be able to hard-fail the backend
        let (text_query, parse_errors) = parser.parse_query_lenient(&Self::query_text(query));
        if !parse_errors.is_empty() {
            tracing::debug!(?parse_errors, "lexical query parsed leniently");
        }

        let mut clauses: Vec<(Occur, Box<dyn tantivy::query::Query>)> =
            vec![(Occur::Must, text_query)];
        if let Some(facet) = &query.filters.facet {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.facet, facet.as_str()),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if let Some(source) = &query.filters.source {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.source, source),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        let boolean_query = BooleanQuery::new(clauses);

        let top_docs = searcher
            .search(&boolean_query, &TopDocs::with_limit(top_k))
            .map_err(|e| AdapterError::Backend(e.to_string()))?;

        let mut candidates = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let retrieved: tantivy::TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| AdapterError::Backend(e.to_string()))?;
            let unit_id = retrieved
                .get_first(self.fields.id)
                .and_then(|v| v.as_str())
                .ok_or_else(|| AdapterError::Index("Missing id field on hit".to_string()))?;
            candidates.push(Candidate::new(unit_id, score));
        }

        sort_candidates(&mut candidates);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::FacetType;
    use crate::query::{Intent, QueryFilters};
    use tempfile::TempDir;

    fn unit(id: &str, text: &str, facet: FacetType) -> RetrievalUnit {
        RetrievalUnit {
            id: id.to_string(),
            document_id: "d1".to_string(),
            start_char: 0,
            end_char: text.len(),
            facet,
            section: Some("results".to_string()),
            text: text.to_string(),
            metadata: serde_json::json!({"title": "anticoagulant trial", "source": "journal"}),
        }
    }

    fn plain_query(text: &str) -> Query {
        Query {
            raw: text.to_string(),
            canonical: text.to_string(),
            intents: vec![(Intent::Lookup, 1.0)],
            must_terms: vec![],
            should_terms: text.split_whitespace().map(str::to_string).collect(),
            negative_terms: vec![],
            expansion_terms: vec![],
            codes: vec![],
            filters: QueryFilters::default(),
            top_k: 10,
            rerank: false,
            explain: true,
        }
    }

    fn build_index(temp: &TempDir) -> std::path::PathBuf {
        let path = temp.path().join("lexical");
        let mut builder = LexicalIndexBuilder::create(&path).unwrap();
        builder
            .add_unit(&unit("u1", "major bleeding events were rare", FacetType::Safety))
            .unwrap();
        builder
            .add_unit(&unit(
                "u2",
                "mortality was reduced in the treatment arm",
                FacetType::Outcome,
            ))
            .unwrap();
        builder
            .add_unit(&unit("u3", "baseline characteristics were balanced", FacetType::Background))
            .unwrap();
        builder.commit().unwrap();
        path
    }

    #[tokio::test]
    async fn finds_matching_units() {
        let temp = TempDir::new().unwrap();
        let path = build_index(&temp);
        let adapter = LexicalAdapter::open(&path, FieldBoosts::default()).unwrap();

        let candidates = adapter.search(&plain_query("mortality"), 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].unit_id, "u2");
    }

    #[tokio::test]
    async fn empty_match_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let path = build_index(&temp);
        let adapter = LexicalAdapter::open(&path, FieldBoosts::default()).unwrap();

        let candidates = adapter
            .search(&plain_query("nonexistent zzz"), 10)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn facet_filter_restricts_results() {
        let temp = TempDir::new().unwrap();
        let path = build_index(&temp);
        let adapter = LexicalAdapter::open(&path, FieldBoosts::default()).unwrap();

        let mut query = plain_query("bleeding mortality baseline");
        query.filters.facet = Some(FacetType::Safety);
        let candidates = adapter.search(&query, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].unit_id, "u1");
    }

    #[tokio::test]
    async fn negative_terms_exclude_units() {
        let temp = TempDir::new().unwrap();
        let path = build_index(&temp);
        let adapter = LexicalAdapter::open(&path, FieldBoosts::default()).unwrap();

        let mut query = plain_query("were");
        query.negative_terms = vec!["bleeding".to_string()];
        let candidates = adapter.search(&query, 10).await.unwrap();
        assert!(candidates.iter().all(|c| c.unit_id != "u1"));
    }
}
