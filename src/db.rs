use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::StoreError;
use crate::models::{
    round_half_up, ExamScope, Grade, GradeAggregateRow, GradeCounts, GradeDistribution,
    GradeThresholds, PartialCutoffs, Percentage, RankedScore, ScoreRange, ScoreRecord,
    ScoreSegmentRow, SegmentTable, ThresholdKey,
};
use crate::store::{FactRow, FactStore, ScoreSource, StatisticsSnapshot, StatisticsStore};

// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK: usize = 1_000;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads a deterministic synthetic population: three cities with a few
/// hundred students each, scores on a 0..=150 scale with one decimal.
pub async fn seed(pool: &PgPool, scope: &ExamScope) -> anyhow::Result<usize> {
    let cities = [
        ("Eastport", 420usize, 96.0),
        ("Northgate", 380, 104.0),
        ("Riverside", 300, 88.0),
    ];

    let mut students = Vec::new();
    let mut state: u64 = 0x5eed_2026;
    for (city, size, centre) in cities {
        for index in 0..size {
            // Sum of three uniform draws, roughly bell-shaped around `centre`.
            let mut spread = 0.0;
            for _ in 0..3 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                spread += (state >> 33) as f64 / (1u64 << 31) as f64;
            }
            let score = ((centre + (spread - 1.5) * 60.0).clamp(0.0, 150.0) * 10.0).round() / 10.0;
            let present = index % 97 != 0;
            let record = ScoreRecord {
                student_id: format!("{}-{index:05}", city[..3].to_uppercase()),
                city: city.to_string(),
                exam_plan: scope.exam_plan.clone(),
                subject: scope.subject.clone(),
                score,
            };
            students.push((record, present));
        }
    }

    let mut inserted = 0;
    for chunk in students.chunks(INSERT_CHUNK) {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO score_banding.score_facts \
             (exam_plan, subject, student_id, city, score, present) ",
        );
        query.push_values(chunk, |mut row, (record, present)| {
            row.push_bind(&record.exam_plan)
                .push_bind(&record.subject)
                .push_bind(&record.student_id)
                .push_bind(&record.city)
                .push_bind(record.score)
                .push_bind(*present);
        });
        query.push(
            " ON CONFLICT (exam_plan, subject, student_id) DO UPDATE \
             SET city = EXCLUDED.city, score = EXCLUDED.score, present = EXCLUDED.present",
        );
        inserted += query.build().execute(pool).await?.rows_affected() as usize;
    }

    Ok(inserted)
}

/// Postgres implementation of every store. The only place SQL column types
/// are converted to domain types.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT city FROM score_banding.score_facts \
             WHERE exam_plan = $1 AND subject = $2 ORDER BY city",
        )
        .bind(&scope.exam_plan)
        .bind(&scope.subject)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("city").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl ScoreSource for PgStore {
    async fn rank(&self, key: &ThresholdKey) -> Result<Vec<RankedScore>, StoreError> {
        let rows = sqlx::query(
            "SELECT student_id, score FROM score_banding.score_facts \
             WHERE exam_plan = $1 AND subject = $2 AND present \
             AND ($3::text IS NULL OR city = $3) \
             ORDER BY score DESC, student_id",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.as_filter())
        .fetch_all(&self.pool)
        .await?;

        let mut ranked = Vec::with_capacity(rows.len());
        for row in rows {
            ranked.push(RankedScore::new(
                row.try_get::<String, _>("student_id")?,
                row.try_get::<f64, _>("score")?,
            ));
        }
        Ok(ranked)
    }

    async fn range(&self, scope: &ExamScope) -> Result<Option<ScoreRange>, StoreError> {
        let row = sqlx::query(
            "SELECT MIN(score) AS low, MAX(score) AS high FROM score_banding.score_facts \
             WHERE exam_plan = $1 AND subject = $2 AND present",
        )
        .bind(&scope.exam_plan)
        .bind(&scope.subject)
        .fetch_one(&self.pool)
        .await?;

        let low: Option<f64> = row.try_get("low")?;
        let high: Option<f64> = row.try_get("high")?;
        Ok(low
            .zip(high)
            .map(|(low, high)| ScoreRange::new(round_half_up(low), round_half_up(high))))
    }

    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError> {
        self.list_cities(scope).await
    }
}

#[async_trait]
impl StatisticsStore for PgStore {
    async fn thresholds(&self, key: &ThresholdKey) -> Result<Option<GradeThresholds>, StoreError> {
        let row = sqlx::query(
            "SELECT cutoff_a, cutoff_b, cutoff_c, cutoff_d, \
             count_a, count_b, count_c, count_d, count_e, total \
             FROM score_banding.grade_thresholds \
             WHERE exam_plan = $1 AND subject = $2 AND city = $3",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.label())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut counts = GradeCounts::default();
        for grade in Grade::ALL {
            let column = format!("count_{}", grade.as_str().to_lowercase());
            counts.add(grade, from_count(key, row.try_get(column.as_str())?)?);
        }
        Ok(Some(GradeThresholds {
            key: key.clone(),
            cutoffs: stored_cutoffs(&row)?,
            counts,
            total: from_count(key, row.try_get("total")?)?,
        }))
    }

    async fn distribution(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<GradeDistribution>, StoreError> {
        let rows = sqlx::query(
            "SELECT grade, count, cumulative_count, cumulative_percentage \
             FROM score_banding.grade_distribution \
             WHERE exam_plan = $1 AND subject = $2 AND city = $3 ORDER BY grade",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.label())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let rows = rows
            .iter()
            .map(|row| aggregate_row(key, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(GradeDistribution {
            key: key.clone(),
            total: rows.last().map_or(0, |row| row.cumulative_count),
            rows,
        }))
    }

    async fn segments(&self, key: &ThresholdKey) -> Result<Option<SegmentTable>, StoreError> {
        let rows = sqlx::query(
            "SELECT score, count, cumulative_count, cumulative_percentage, grade \
             FROM score_banding.score_segments \
             WHERE exam_plan = $1 AND subject = $2 AND city = $3 ORDER BY score DESC",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.label())
        .fetch_all(&self.pool)
        .await?;

        let rows = rows
            .iter()
            .map(|row| segment_row(key, row))
            .collect::<Result<Vec<_>, _>>()?;
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(None);
        };
        Ok(Some(SegmentTable {
            key: key.clone(),
            range: ScoreRange::new(last.score, first.score),
            total: last.cumulative_count,
            rows,
        }))
    }

    async fn replace_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<(), StoreError> {
        let key = snapshot.key();
        let city = key.city.label();
        let mut tx = self.pool.begin().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(key.cache_key("confirm"))
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(StoreError::Conflict(key.to_string()));
        }

        // The caller merged onto cutoffs it read before this transaction began.
        let row = sqlx::query(
            "SELECT cutoff_a, cutoff_b, cutoff_c, cutoff_d FROM score_banding.grade_thresholds \
             WHERE exam_plan = $1 AND subject = $2 AND city = $3 FOR UPDATE",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(city)
        .fetch_optional(&mut *tx)
        .await?;
        let stored = match row {
            Some(row) => stored_cutoffs(&row)?,
            None => PartialCutoffs::default(),
        };
        if stored != snapshot.expected {
            return Err(StoreError::Conflict(key.to_string()));
        }

        let thresholds = &snapshot.thresholds;
        let counts = thresholds.counts;
        sqlx::query(
            r#"
            INSERT INTO score_banding.grade_thresholds
            (exam_plan, subject, city, cutoff_a, cutoff_b, cutoff_c, cutoff_d,
             count_a, count_b, count_c, count_d, count_e, total, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (exam_plan, subject, city) DO UPDATE
            SET cutoff_a = EXCLUDED.cutoff_a, cutoff_b = EXCLUDED.cutoff_b,
                cutoff_c = EXCLUDED.cutoff_c, cutoff_d = EXCLUDED.cutoff_d,
                count_a = EXCLUDED.count_a, count_b = EXCLUDED.count_b,
                count_c = EXCLUDED.count_c, count_d = EXCLUDED.count_d,
                count_e = EXCLUDED.count_e, total = EXCLUDED.total,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(city)
        .bind(thresholds.cutoffs.a)
        .bind(thresholds.cutoffs.b)
        .bind(thresholds.cutoffs.c)
        .bind(thresholds.cutoffs.d)
        .bind(to_count(key, counts.get(Grade::A))?)
        .bind(to_count(key, counts.get(Grade::B))?)
        .bind(to_count(key, counts.get(Grade::C))?)
        .bind(to_count(key, counts.get(Grade::D))?)
        .bind(to_count(key, counts.get(Grade::E))?)
        .bind(to_count(key, thresholds.total)?)
        .execute(&mut *tx)
        .await?;

        for table in ["grade_distribution", "score_segments"] {
            sqlx::query(&format!(
                "DELETE FROM score_banding.{table} \
                 WHERE exam_plan = $1 AND subject = $2 AND city = $3"
            ))
            .bind(&key.exam_plan)
            .bind(&key.subject)
            .bind(city)
            .execute(&mut *tx)
            .await?;
        }

        let aggregates = snapshot
            .distribution
            .rows
            .iter()
            .map(|row| {
                Ok((
                    row.grade.as_str(),
                    to_count(key, row.count)?,
                    to_count(key, row.cumulative_count)?,
                    row.cumulative_percentage.to_string(),
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        if !aggregates.is_empty() {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO score_banding.grade_distribution \
                 (exam_plan, subject, city, grade, count, \
                 cumulative_count, cumulative_percentage) ",
            );
            query.push_values(&aggregates, |mut row, (grade, count, cumulative, percentage)| {
                row.push_bind(&key.exam_plan)
                    .push_bind(&key.subject)
                    .push_bind(city)
                    .push_bind(*grade)
                    .push_bind(*count)
                    .push_bind(*cumulative)
                    .push_bind(percentage);
            });
            query.build().execute(&mut *tx).await?;
        }

        let details = snapshot
            .segments
            .rows
            .iter()
            .map(|row| {
                Ok((
                    row.score,
                    to_count(key, row.count)?,
                    to_count(key, row.cumulative_count)?,
                    row.cumulative_percentage.to_string(),
                    row.grade.map(Grade::as_str),
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        for chunk in details.chunks(INSERT_CHUNK) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO score_banding.score_segments \
                 (exam_plan, subject, city, score, count, \
                 cumulative_count, cumulative_percentage, grade) ",
            );
            query.push_values(chunk, |mut row, (score, count, cumulative, percentage, grade)| {
                row.push_bind(&key.exam_plan)
                    .push_bind(&key.subject)
                    .push_bind(city)
                    .push_bind(*score)
                    .push_bind(*count)
                    .push_bind(*cumulative)
                    .push_bind(percentage)
                    .push_bind(*grade);
            });
            query.build().execute(&mut *tx).await?;
        }

        if let Some(audit) = &snapshot.audit {
            sqlx::query(
                r#"
                INSERT INTO score_banding.adjustment_log
                (id, exam_plan, subject, city, operator, reason,
                 before_a, before_b, before_c, before_d,
                 after_a, after_b, after_c, after_d, confirmed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(audit.id)
            .bind(&key.exam_plan)
            .bind(&key.subject)
            .bind(city)
            .bind(&audit.operator)
            .bind(&audit.reason)
            .bind(audit.before.a)
            .bind(audit.before.b)
            .bind(audit.before.c)
            .bind(audit.before.d)
            .bind(audit.after.a)
            .bind(audit.after.b)
            .bind(audit.after.c)
            .bind(audit.after.d)
            .bind(audit.confirmed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl FactStore for PgStore {
    async fn cities(&self, scope: &ExamScope) -> Result<Vec<String>, StoreError> {
        self.list_cities(scope).await
    }

    async fn students_after(
        &self,
        key: &ThresholdKey,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FactRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT student_id, score, grade FROM score_banding.score_facts \
             WHERE exam_plan = $1 AND subject = $2 AND city = $3 AND present \
             AND ($4::text IS NULL OR student_id > $4) \
             ORDER BY student_id LIMIT $5",
        )
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.label())
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut facts = Vec::with_capacity(rows.len());
        for row in rows {
            let grade: Option<String> = row.try_get("grade")?;
            facts.push(FactRow {
                student_id: row.try_get("student_id")?,
                score: row.try_get("score")?,
                grade: grade.map(|grade| parse_grade(key, &grade)).transpose()?,
            });
        }
        Ok(facts)
    }

    async fn update_grades(
        &self,
        key: &ThresholdKey,
        grades: &[(String, Grade)],
    ) -> Result<usize, StoreError> {
        let (students, labels): (Vec<String>, Vec<String>) = grades
            .iter()
            .map(|(student_id, grade)| (student_id.clone(), grade.as_str().to_string()))
            .unzip();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE score_banding.score_facts AS f
            SET grade = u.grade
            FROM UNNEST($1::text[], $2::text[]) AS u(student_id, grade)
            WHERE f.exam_plan = $3 AND f.subject = $4 AND f.city = $5
              AND f.student_id = u.student_id
            "#,
        )
        .bind(&students)
        .bind(&labels)
        .bind(&key.exam_plan)
        .bind(&key.subject)
        .bind(key.city.label())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() as usize)
    }
}

fn stored_cutoffs(row: &PgRow) -> Result<PartialCutoffs, StoreError> {
    Ok(PartialCutoffs {
        a: row.try_get("cutoff_a")?,
        b: row.try_get("cutoff_b")?,
        c: row.try_get("cutoff_c")?,
        d: row.try_get("cutoff_d")?,
    })
}

fn aggregate_row(key: &ThresholdKey, row: &PgRow) -> Result<GradeAggregateRow, StoreError> {
    let grade: String = row.try_get("grade")?;
    let percentage: String = row.try_get("cumulative_percentage")?;
    Ok(GradeAggregateRow {
        grade: parse_grade(key, &grade)?,
        count: from_count(key, row.try_get("count")?)?,
        cumulative_count: from_count(key, row.try_get("cumulative_count")?)?,
        cumulative_percentage: parse_percentage(key, &percentage)?,
    })
}

fn segment_row(key: &ThresholdKey, row: &PgRow) -> Result<ScoreSegmentRow, StoreError> {
    let grade: Option<String> = row.try_get("grade")?;
    let percentage: String = row.try_get("cumulative_percentage")?;
    Ok(ScoreSegmentRow {
        score: row.try_get("score")?,
        count: from_count(key, row.try_get("count")?)?,
        cumulative_count: from_count(key, row.try_get("cumulative_count")?)?,
        cumulative_percentage: parse_percentage(key, &percentage)?,
        grade: grade.map(|grade| parse_grade(key, &grade)).transpose()?,
    })
}

fn corrupt(key: &ThresholdKey, detail: String) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        detail,
    }
}

fn parse_grade(key: &ThresholdKey, value: &str) -> Result<Grade, StoreError> {
    Grade::parse(value).ok_or_else(|| corrupt(key, format!("unknown grade '{value}'")))
}

fn parse_percentage(key: &ThresholdKey, value: &str) -> Result<Percentage, StoreError> {
    value.parse().map_err(|detail| corrupt(key, detail))
}

fn from_count(key: &ThresholdKey, value: i32) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| corrupt(key, format!("negative count {value}")))
}

fn to_count(key: &ThresholdKey, value: usize) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| corrupt(key, format!("count {value} out of range")))
}
