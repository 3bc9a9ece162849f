use sqlx::SqlitePool;

/// Registry of named collections in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Students,
    Applications,
    Templates,
    DataSegments,
    Scholarships,
    Vouchers,
    InterviewSlots,
    CommunicationLogs,
    BackgroundJobs,
}

impl Collection {
    pub const ALL: [Collection; 10] = [
        Collection::Users,
        Collection::Students,
        Collection::Applications,
        Collection::Templates,
        Collection::DataSegments,
        Collection::Scholarships,
        Collection::Vouchers,
        Collection::InterviewSlots,
        Collection::CommunicationLogs,
        Collection::BackgroundJobs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Students => "studentsPrimaryDetails",
            Collection::Applications => "studentApplicationForms",
            Collection::Templates => "communicationTemplates",
            Collection::DataSegments => "dataSegments",
            Collection::Scholarships => "scholarships",
            Collection::Vouchers => "promocodes",
            Collection::InterviewSlots => "interviewSlots",
            Collection::CommunicationLogs => "communicationLogs",
            Collection::BackgroundJobs => "backgroundJobs",
        }
    }
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    // Pragmas for better durability/performance
    if let Err(e) = sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await {
        tracing::warn!("Failed to set WAL journal mode: {}", e);
    }
    if let Err(e) = sqlx::query("PRAGMA synchronous=NORMAL;").execute(pool).await {
        tracing::warn!("Failed to set synchronous mode: {}", e);
    }
    if let Err(e) = sqlx::query("PRAGMA busy_timeout=10000;").execute(pool).await {
        tracing::warn!("Failed to set busy_timeout: {}", e);
    }

    // JSON functions are required by the query compiler
    sqlx::query("SELECT json_extract('{\"a\":1}', '$.a')").execute(pool).await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL CHECK (json_valid(body)),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        )"#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        (
            "idx_documents_college",
            "CREATE INDEX IF NOT EXISTS idx_documents_college ON documents(collection, json_extract(body, '$.college_id'))",
        ),
        (
            "idx_documents_email",
            "CREATE INDEX IF NOT EXISTS idx_documents_email ON documents(collection, json_extract(body, '$.email'))",
        ),
        (
            "idx_documents_student",
            "CREATE INDEX IF NOT EXISTS idx_documents_student ON documents(collection, json_extract(body, '$.student_id'))",
        ),
        (
            "idx_documents_token",
            "CREATE INDEX IF NOT EXISTS idx_documents_token ON documents(collection, json_extract(body, '$.token_hash'))",
        ),
        (
            "idx_documents_created",
            "CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(collection, created_at)",
        ),
    ];

    for (name, query) in indexes {
        if let Err(e) = sqlx::query(query).execute(pool).await {
            match &e {
                sqlx::Error::Database(db_err) => {
                    let msg = db_err.message().to_lowercase();
                    if msg.contains("already exists") || msg.contains("duplicate") {
                        tracing::debug!("Index {} already exists, skipping", name);
                    } else {
                        tracing::warn!("Failed to create index {}: {}", name, e);
                    }
                }
                _ => {
                    tracing::warn!("Failed to create index {}: {}", name, e);
                }
            }
        }
    }

    Ok(())
}
