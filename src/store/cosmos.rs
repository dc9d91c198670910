//! Azure Cosmos DB (SQL API) over its REST interface.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::{Conversation, ConversationStore, Step, Thread, ThreadFilter, ThreadStore, Turn};
use crate::config::{ConversationStoreSettings, CosmosSettings, DataLayerSettings};
use crate::constants::COSMOS_API_VERSION;
use crate::error::{BuddyError, Result};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "cosmos db";

/// Builds the `Authorization` header value for a master-key signed request.
pub fn master_key_token(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| BuddyError::Config(format!("invalid cosmos key: {}", e)))?;
    mac.update(payload.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());
    let token = format!("type=master&ver=1.0&sig={}", signature);
    Ok(urlencoding::encode(&token).into_owned())
}

#[derive(Deserialize)]
struct QueryPage<T> {
    #[serde(rename = "Documents")]
    documents: Vec<T>,
}

#[derive(Serialize)]
struct QueryParameter<'a> {
    name: &'a str,
    value: Value,
}

/// Minimal document client for one Cosmos DB account.
#[derive(Clone)]
pub struct CosmosClient {
    http: Client,
    endpoint: String,
    key: Vec<u8>,
}

impl CosmosClient {
    pub fn new(settings: &CosmosSettings) -> Result<Self> {
        let key = BASE64
            .decode(settings.key.trim())
            .map_err(|e| BuddyError::Config(format!("COSMOS_DB_KEY is not valid base64: {}", e)))?;
        Ok(Self {
            http: Client::new(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            key,
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        resource_type: &str,
        resource_link: &str,
    ) -> Result<RequestBuilder> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let token = master_key_token(&self.key, method.as_str(), resource_type, resource_link, &date)?;
        Ok(self
            .http
            .request(method, format!("{}/{}", self.endpoint, path))
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", COSMOS_API_VERSION))
    }

    async fn check(response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(BuddyError::Upstream {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }

    fn partition_header(partition_key: &str) -> String {
        json!([partition_key]).to_string()
    }

    /// Creates the database unless it already exists.
    pub async fn ensure_database(&self, database: &str) -> Result<()> {
        let response = self
            .request(Method::POST, "dbs", "dbs", "")?
            .json(&json!({ "id": database }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Database {} already exists", database);
            return Ok(());
        }
        Self::check(response).await?;
        info!("Created database {}", database);
        Ok(())
    }

    /// Creates the container unless it already exists.
    pub async fn ensure_container(
        &self,
        database: &str,
        container: &str,
        partition_key_path: &str,
    ) -> Result<()> {
        let link = format!("dbs/{}", database);
        let response = self
            .request(Method::POST, &format!("{}/colls", link), "colls", &link)?
            .json(&json!({
                "id": container,
                "partitionKey": { "paths": [partition_key_path], "kind": "Hash" }
            }))
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Container {}/{} already exists", database, container);
            return Ok(());
        }
        Self::check(response).await?;
        info!("Created container {}/{}", database, container);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn read_document<T: DeserializeOwned>(
        &self,
        database: &str,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<T>> {
        let link = format!("dbs/{}/colls/{}/docs/{}", database, container, id);
        let response = self
            .request(Method::GET, &link, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", Self::partition_header(partition_key))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn write_document<T: Serialize + ?Sized>(
        &self,
        database: &str,
        container: &str,
        document: &T,
        partition_key: &str,
        upsert: bool,
    ) -> Result<()> {
        let link = format!("dbs/{}/colls/{}", database, container);
        let response = self
            .request(Method::POST, &format!("{}/docs", link), "docs", &link)?
            .header("x-ms-documentdb-partitionkey", Self::partition_header(partition_key))
            .header("x-ms-documentdb-is-upsert", if upsert { "True" } else { "False" })
            .json(document)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_document<T: Serialize + ?Sized>(
        &self,
        database: &str,
        container: &str,
        document: &T,
        partition_key: &str,
    ) -> Result<()> {
        self.write_document(database, container, document, partition_key, false)
            .await
    }

    pub async fn upsert_document<T: Serialize + ?Sized>(
        &self,
        database: &str,
        container: &str,
        document: &T,
        partition_key: &str,
    ) -> Result<()> {
        self.write_document(database, container, document, partition_key, true)
            .await
    }

    pub async fn replace_document<T: Serialize + ?Sized>(
        &self,
        database: &str,
        container: &str,
        id: &str,
        document: &T,
        partition_key: &str,
    ) -> Result<()> {
        let link = format!("dbs/{}/colls/{}/docs/{}", database, container, id);
        let response = self
            .request(Method::PUT, &link, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", Self::partition_header(partition_key))
            .json(document)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Returns `false` when the document did not exist.
    pub async fn delete_document(
        &self,
        database: &str,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<bool> {
        let link = format!("dbs/{}/colls/{}/docs/{}", database, container, id);
        let response = self
            .request(Method::DELETE, &link, "docs", &link)?
            .header("x-ms-documentdb-partitionkey", Self::partition_header(partition_key))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Runs a parameterised cross-partition query, following continuation tokens.
    #[instrument(skip(self, parameters))]
    pub async fn query_documents<T: DeserializeOwned>(
        &self,
        database: &str,
        container: &str,
        query: &str,
        parameters: Vec<(&str, Value)>,
    ) -> Result<Vec<T>> {
        let link = format!("dbs/{}/colls/{}", database, container);
        let body = json!({
            "query": query,
            "parameters": parameters
                .into_iter()
                .map(|(name, value)| QueryParameter { name, value })
                .collect::<Vec<_>>(),
        });

        let mut documents = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .request(Method::POST, &format!("{}/docs", link), "docs", &link)?
                .header("content-type", "application/query+json")
                .header("x-ms-documentdb-isquery", "True")
                .header("x-ms-documentdb-query-enablecrosspartition", "True");
            if let Some(token) = &continuation {
                request = request.header("x-ms-continuation", token);
            }
            // `.json()` would reset the content type the query API requires.
            let response = Self::check(request.body(body.to_string()).send().await?).await?;
            continuation = response
                .headers()
                .get("x-ms-continuation")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let page: QueryPage<T> = response.json().await?;
            documents.extend(page.documents);
            if continuation.is_none() {
                break;
            }
        }
        Ok(documents)
    }
}

/// Conversation log stored one document per chat.
pub struct CosmosConversationStore {
    client: CosmosClient,
    database: String,
    container: String,
    partition_key: String,
}

impl CosmosConversationStore {
    pub async fn connect(settings: &ConversationStoreSettings) -> Result<Self> {
        let client = CosmosClient::new(&settings.cosmos)?;
        client.ensure_database(&settings.database).await?;
        client
            .ensure_container(
                &settings.database,
                &settings.container,
                &format!("/{}", settings.partition_key),
            )
            .await?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: CosmosClient, settings: &ConversationStoreSettings) -> Self {
        Self {
            client,
            database: settings.database.clone(),
            container: settings.container.clone(),
            partition_key: settings.partition_key.clone(),
        }
    }

    fn partition_value(chat_id: &str) -> String {
        format!("{}_partkey", chat_id)
    }

    fn to_document(&self, conversation: &Conversation) -> Result<Value> {
        let mut document = serde_json::to_value(conversation)?;
        if let Value::Object(map) = &mut document {
            map.insert(
                self.partition_key.clone(),
                Value::String(Self::partition_value(&conversation.id)),
            );
        }
        Ok(document)
    }

    async fn load(&self, chat_id: &str) -> Result<Conversation> {
        self.get_conversation(chat_id)
            .await?
            .ok_or_else(|| BuddyError::not_found(format!("conversation {}", chat_id)))
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let document = self.to_document(conversation)?;
        self.client
            .replace_document(
                &self.database,
                &self.container,
                &conversation.id,
                &document,
                &Self::partition_value(&conversation.id),
            )
            .await
    }
}

#[async_trait]
impl ConversationStore for CosmosConversationStore {
    async fn create_conversation(&self, chat_id: &str) -> Result<()> {
        let document = self.to_document(&Conversation::new(chat_id))?;
        self.client
            .create_document(
                &self.database,
                &self.container,
                &document,
                &Self::partition_value(chat_id),
            )
            .await?;
        info!("Created new conversation with chat_id: {}", chat_id);
        Ok(())
    }

    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>> {
        let conversation = self
            .client
            .read_document(
                &self.database,
                &self.container,
                chat_id,
                &Self::partition_value(chat_id),
            )
            .await?;
        if conversation.is_none() {
            info!("No existing conversation found for ID: {}", chat_id);
        }
        Ok(conversation)
    }

    async fn append_turn(&self, chat_id: &str, turn: Turn) -> Result<()> {
        let mut conversation = self.load(chat_id).await?;
        conversation.conversation.push(turn);
        self.save(&conversation).await?;
        info!("Successfully updated conversation for chat_id: {}", chat_id);
        Ok(())
    }

    async fn upsert_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        vote: i64,
        text: &str,
    ) -> Result<()> {
        let mut conversation = self.load(chat_id).await?;
        let turn = conversation.turn_mut(message_id).ok_or_else(|| {
            BuddyError::not_found(format!("message {} in conversation {}", message_id, chat_id))
        })?;
        turn.feedback_vote = vote;
        turn.feedback_text = text.to_string();
        self.save(&conversation).await?;
        info!("Feedback updated for message {} in chat {}", message_id, chat_id);
        Ok(())
    }
}

/// Threads and steps, each container partitioned on `/id`.
pub struct CosmosThreadStore {
    client: CosmosClient,
    database: String,
    threads: String,
    steps: String,
}

impl CosmosThreadStore {
    pub async fn connect(settings: &DataLayerSettings) -> Result<Self> {
        let client = CosmosClient::new(&settings.cosmos)?;
        client.ensure_database(&settings.database).await?;
        client
            .ensure_container(&settings.database, &settings.threads_container, "/id")
            .await?;
        client
            .ensure_container(&settings.database, &settings.steps_container, "/id")
            .await?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: CosmosClient, settings: &DataLayerSettings) -> Self {
        Self {
            client,
            database: settings.database.clone(),
            threads: settings.threads_container.clone(),
            steps: settings.steps_container.clone(),
        }
    }
}

#[async_trait]
impl ThreadStore for CosmosThreadStore {
    async fn upsert_step(&self, step: &Step) -> Result<()> {
        self.client
            .upsert_document(&self.database, &self.steps, step, &step.id)
            .await
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        self.client
            .read_document(&self.database, &self.steps, step_id, step_id)
            .await
    }

    async fn delete_step(&self, step_id: &str) -> Result<()> {
        if !self
            .client
            .delete_document(&self.database, &self.steps, step_id, step_id)
            .await?
        {
            warn!("Step not found: {}", step_id);
            return Err(BuddyError::not_found(format!("step {}", step_id)));
        }
        Ok(())
    }

    async fn steps_for_thread(&self, thread_id: &str) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .client
            .query_documents(
                &self.database,
                &self.steps,
                "SELECT * FROM s WHERE s.threadId = @thread_id",
                vec![("@thread_id", json!(thread_id))],
            )
            .await?;
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        self.client
            .read_document(&self.database, &self.threads, thread_id, thread_id)
            .await
    }

    async fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        self.client
            .upsert_document(&self.database, &self.threads, thread, &thread.id)
            .await
    }

    async fn delete_steps_for_thread(&self, thread_id: &str) -> Result<usize> {
        let steps = self.steps_for_thread(thread_id).await?;
        let mut deleted = 0;
        for step in &steps {
            if self
                .client
                .delete_document(&self.database, &self.steps, &step.id, &step.id)
                .await?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.delete_steps_for_thread(thread_id).await?;
        if !self
            .client
            .delete_document(&self.database, &self.threads, thread_id, thread_id)
            .await?
        {
            warn!("Thread not found: {}", thread_id);
            return Err(BuddyError::not_found(format!("thread {}", thread_id)));
        }
        Ok(())
    }

    async fn find_threads(&self, filter: &ThreadFilter) -> Result<Vec<Thread>> {
        let mut query = String::from("SELECT * FROM t WHERE 1=1");
        let mut parameters = Vec::new();
        if let Some(user_id) = &filter.user_id {
            query.push_str(" AND t.userId = @user_id");
            parameters.push(("@user_id", json!(user_id)));
        }
        if let Some(tag) = &filter.tag {
            query.push_str(" AND ARRAY_CONTAINS(t.tags, @tag)");
            parameters.push(("@tag", json!(tag)));
        }
        // Cross-partition ORDER BY needs a query plan the REST gateway does not run.
        let mut threads: Vec<Thread> = self
            .client
            .query_documents(&self.database, &self.threads, &query, parameters)
            .await?;
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    async fn find_thread_with_feedback(&self, message_id: &str) -> Result<Option<Thread>> {
        let threads: Vec<Thread> = self
            .client
            .query_documents(
                &self.database,
                &self.threads,
                "SELECT * FROM t WHERE EXISTS(SELECT VALUE f FROM f IN t.feedback WHERE f.message_id = @message_id)",
                vec![("@message_id", json!(message_id))],
            )
            .await?;
        Ok(threads.into_iter().next())
    }
}
