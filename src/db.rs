use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("bulletins.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS etablissements(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS annees_scolaires(
            id TEXT PRIMARY KEY,
            etablissement_id TEXT NOT NULL,
            libelle TEXT NOT NULL,
            FOREIGN KEY(etablissement_id) REFERENCES etablissements(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periodes(
            id TEXT PRIMARY KEY,
            annee_scolaire_id TEXT NOT NULL,
            nom TEXT NOT NULL,
            ordre INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(annee_scolaire_id) REFERENCES annees_scolaires(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periodes_annee ON periodes(annee_scolaire_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            etablissement_id TEXT NOT NULL,
            nom TEXT NOT NULL,
            FOREIGN KEY(etablissement_id) REFERENCES etablissements(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_etablissement ON classes(etablissement_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS matieres(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL UNIQUE,
            coefficient REAL NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS eleves(
            id TEXT PRIMARY KEY,
            classe_id TEXT NOT NULL,
            nom TEXT NOT NULL,
            prenoms TEXT NOT NULL,
            sexe TEXT,
            matricule TEXT NOT NULL UNIQUE,
            statut TEXT NOT NULL DEFAULT 'inscrit',
            date_naissance TEXT,
            FOREIGN KEY(classe_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_eleves_classe ON eleves(classe_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS types_evaluations(
            id TEXT PRIMARY KEY,
            nom TEXT NOT NULL UNIQUE,
            coefficient REAL NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            classe_id TEXT NOT NULL,
            matiere_id TEXT NOT NULL,
            periode_id TEXT NOT NULL,
            type_evaluation_id TEXT NOT NULL,
            titre TEXT NOT NULL,
            note_sur REAL NOT NULL DEFAULT 20 CHECK(note_sur > 0),
            date_evaluation TEXT,
            FOREIGN KEY(classe_id) REFERENCES classes(id),
            FOREIGN KEY(matiere_id) REFERENCES matieres(id),
            FOREIGN KEY(periode_id) REFERENCES periodes(id),
            FOREIGN KEY(type_evaluation_id) REFERENCES types_evaluations(id),
            UNIQUE(classe_id, matiere_id, periode_id, titre)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_classe ON evaluations(classe_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_periode ON evaluations(periode_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_matiere ON evaluations(matiere_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notes(
            id TEXT PRIMARY KEY,
            eleve_id TEXT NOT NULL,
            evaluation_id TEXT NOT NULL,
            note REAL,
            statut TEXT NOT NULL DEFAULT 'present',
            commentaire TEXT,
            saisie_par TEXT,
            FOREIGN KEY(eleve_id) REFERENCES eleves(id),
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            UNIQUE(eleve_id, evaluation_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notes_eleve ON notes(eleve_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notes_evaluation ON notes(evaluation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulletins(
            id TEXT PRIMARY KEY,
            eleve_id TEXT NOT NULL,
            periode_id TEXT NOT NULL,
            moyenne_generale REAL,
            rang_classe INTEGER,
            fichier_pdf TEXT,
            genere_par TEXT,
            genere_le TEXT,
            FOREIGN KEY(eleve_id) REFERENCES eleves(id),
            FOREIGN KEY(periode_id) REFERENCES periodes(id),
            UNIQUE(eleve_id, periode_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulletins_eleve ON bulletins(eleve_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulletins_periode ON bulletins(periode_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS imports_fichiers(
            id TEXT PRIMARY KEY,
            nom_fichier TEXT NOT NULL,
            type_fichier TEXT NOT NULL,
            statut TEXT NOT NULL DEFAULT 'en_cours',
            chemin_original TEXT NOT NULL,
            chemin_csv TEXT,
            cible TEXT,
            classe_id TEXT,
            nombre_lignes INTEGER NOT NULL DEFAULT 0,
            nombre_erreurs INTEGER NOT NULL DEFAULT 0,
            details_erreurs TEXT NOT NULL DEFAULT '[]',
            importe_par TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_imports_statut ON imports_fichiers(statut)",
        [],
    )?;

    // Workspaces created before upload fingerprinting lack the column.
    ensure_imports_empreinte(&conn)?;

    Ok(conn)
}

fn ensure_imports_empreinte(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "imports_fichiers", "empreinte_sha256")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE imports_fichiers ADD COLUMN empreinte_sha256 TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
