// src/orchestrator/mod.rs
// Query orchestration: validate, retrieve, assemble the prompt, generate.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::embeddings::Embedder;
use crate::error::{MnemoError, Result};
use crate::llm::Generator;
use crate::prompt::PromptBuilder;
use crate::retrieval::Retriever;
use crate::store::{ScoredDocument, VectorStore};
use crate::validator::{RuleBasedValidator, ValidationContext};

pub struct QueryOrchestrator {
    retriever: Retriever,
    prompt_builder: PromptBuilder,
    validator: RuleBasedValidator,
    generator: Option<Arc<dyn Generator>>,
    store: Arc<VectorStore>,
    config: OrchestratorConfig,
}

impl QueryOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        prompt_builder: PromptBuilder,
        generator: Option<Arc<dyn Generator>>,
        config: OrchestratorConfig,
    ) -> Self {
        let expander = crate::retrieval::QueryExpander::new(
            generator.clone(),
            config.enable_query_expansion,
        );
        let retriever = Retriever::new(embedder, store.clone(), expander);
        let validator = RuleBasedValidator::new(
            config.allowed_sources.clone(),
            config.collect_all_failures,
        );
        Self {
            retriever,
            prompt_builder,
            validator,
            generator,
            store,
            config,
        }
    }

    /// Answer a user query end to end.
    ///
    /// Validation failures and generator outages resolve to the configured
    /// user-facing messages rather than errors.
    pub async fn process_query(&self, source: &str, user_id: &str, query: &str) -> Result<String> {
        let context = ValidationContext {
            source: source.to_string(),
            user_id: user_id.to_string(),
            permission_level: 1,
            hour_override: None,
        };
        let rules = self.config.rules_for(user_id);

        let (ok, failures) = self.validator.validate(query, &context, &rules)?;
        if !ok {
            info!(user = user_id, "query rejected: {}", failures.join("; "));
            return Ok(self.config.not_allowed_message.clone());
        }

        let documents = self.get_context(query).await?;
        debug!(documents = documents.len(), "context retrieved");

        let prompt = self.prompt_builder.build_prompt(
            query,
            &documents
                .iter()
                .map(|hit| hit.document.clone())
                .collect::<Vec<_>>(),
        );

        let Some(generator) = &self.generator else {
            return Err(MnemoError::Config(
                "no generator configured for query answering".into(),
            ));
        };
        match generator.generate(&prompt, None).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!("generation failed: {}", e);
                Ok(self.config.generation_failed_message.clone())
            }
        }
    }

    /// Retrieve the documents that would ground an answer, without calling
    /// the generator.
    pub async fn get_context(&self, query: &str) -> Result<Vec<ScoredDocument>> {
        self.retriever
            .retrieve(
                query,
                self.config.num_results,
                self.config.similarity_threshold,
            )
            .await
    }

    /// Aggregate health across the store.
    pub async fn healthcheck(&self) -> crate::store::Health {
        self.store.healthcheck().await
    }
}
